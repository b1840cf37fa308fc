use std::sync::Arc;

use magpie_extract::{ContentExtractor, SearchBackend};
use magpie_providers::Provider;
use magpie_store::Store;
use magpie_tools::ToolServices;

use crate::cancellation::CancellationRegistry;
use crate::config::EngineConfig;
use crate::event_bus::EventBus;

/// The typed handle threaded through constructors instead of ambient
/// singletons. HTTP handlers and workers share this; nothing else is
/// process-global.
#[derive(Clone)]
pub struct Services {
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub provider: Arc<dyn Provider>,
    pub search: Arc<dyn SearchBackend>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub bus: EventBus,
    pub cancellations: CancellationRegistry,
}

impl Services {
    pub fn tool_services(&self) -> ToolServices {
        ToolServices {
            store: self.store.clone(),
            search: self.search.clone(),
            extractor: self.extractor.clone(),
            provider: self.provider.clone(),
            events: Arc::new(self.bus.clone()),
        }
    }
}
