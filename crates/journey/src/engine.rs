use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use nurture_channels::{ConversionReporter, SendGridProvider, SequenceTemplates};
use nurture_core::channels::MessageSender;
use nurture_core::error::NurtureResult;
use nurture_core::event_bus::{EventSink, TracingSink};
use nurture_core::templates::ContentBinder;
use nurture_core::types::SessionRecord;
use nurture_core::AppConfig;

use crate::correlator::EngagementCorrelator;
use crate::dispatcher::DeliveryDispatcher;
use crate::enrollment::EnrollmentService;
use crate::payment::PaymentTrigger;
use crate::scheduler::CampaignScheduler;
use crate::store::SessionStore;

/// Wires every nurture component around one shared session store.
#[derive(Clone)]
pub struct NurtureEngine {
    pub store: SessionStore,
    pub dispatcher: Arc<DeliveryDispatcher>,
    pub scheduler: Arc<CampaignScheduler>,
    pub correlator: Arc<EngagementCorrelator>,
    pub payments: Arc<PaymentTrigger>,
    pub enrollment: Arc<EnrollmentService>,
}

impl std::fmt::Debug for NurtureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NurtureEngine")
            .field("sessions", &self.store.len())
            .finish()
    }
}

impl NurtureEngine {
    /// Builds the engine around explicit collaborators.
    pub fn new(
        config: &AppConfig,
        sender: Arc<dyn MessageSender>,
        binder: Arc<dyn ContentBinder>,
        reporter: Arc<ConversionReporter>,
        event_sink: Arc<dyn EventSink>,
    ) -> NurtureResult<Self> {
        let store = SessionStore::new();

        let dispatcher = Arc::new(
            DeliveryDispatcher::new(
                store.clone(),
                sender,
                binder,
                config.links.clone(),
                &config.delivery,
            )?
            .with_event_sink(event_sink.clone()),
        );
        let scheduler = Arc::new(
            CampaignScheduler::new(store.clone(), dispatcher.clone(), &config.scheduler)?
                .with_event_sink(event_sink.clone()),
        );
        let correlator =
            Arc::new(EngagementCorrelator::new(store.clone()).with_event_sink(event_sink.clone()));
        let payments = Arc::new(
            PaymentTrigger::new(
                store.clone(),
                dispatcher.clone(),
                reporter.clone(),
                &config.payment,
                config.links.clone(),
            )
            .with_event_sink(event_sink.clone()),
        );
        let enrollment = Arc::new(
            EnrollmentService::new(store.clone(), reporter, config.links.clone())
                .with_event_sink(event_sink),
        );

        Ok(Self {
            store,
            dispatcher,
            scheduler,
            correlator,
            payments,
            enrollment,
        })
    }

    /// Production wiring: SendGrid delivery, compiled-in templates, Meta
    /// conversion reporting when configured, events to the log.
    pub fn from_config(config: &AppConfig) -> NurtureResult<Self> {
        let sendgrid = SendGridProvider::new(
            config.sendgrid.clone(),
            Duration::from_millis(config.delivery.send_timeout_ms),
        )?;
        if !sendgrid.is_configured() {
            warn!("SendGrid API key missing; every send will fail until configured");
        }
        let reporter = Arc::new(ConversionReporter::from_config(&config.attribution));
        info!(
            attribution = reporter.is_enabled(),
            delay_scale = config.scheduler.delay_scale,
            "Nurture engine configured"
        );

        Self::new(
            config,
            Arc::new(sendgrid),
            Arc::new(SequenceTemplates::new()),
            reporter,
            Arc::new(TracingSink),
        )
    }

    pub fn session(&self, id: &Uuid) -> Option<SessionRecord> {
        self.store.get(id)
    }
}
