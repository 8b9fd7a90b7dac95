use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use corral_allocator::authorizer::Authorizer;
use corral_allocator::registrar::InMemoryRegistrar;
use corral_allocator::{Allocator, AllocatorConfig, DispatchAllocator, FrameworkInfo, SlaveInfo};
use corral_id::{FrameworkId, SlaveId};

use crate::sink::{OfferRecorder, RecordingOfferSink};

/// A running allocator whose offers are recorded.
pub struct TestAllocator {
    pub allocator: DispatchAllocator,
    pub offers: OfferRecorder,
    pub registrar: Arc<InMemoryRegistrar>,
}

impl TestAllocator {
    pub fn start(config: AllocatorConfig) -> Self {
        Self::start_with(config, Arc::new(InMemoryRegistrar::new()), None)
    }

    pub fn start_with(
        config: AllocatorConfig,
        registrar: Arc<InMemoryRegistrar>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Self {
        crate::init_tracing();
        let (sink, offers) = RecordingOfferSink::channel();
        let allocator = DispatchAllocator::initialize(
            config,
            Arc::new(sink),
            registrar.clone(),
            authorizer,
        );
        Self {
            allocator,
            offers,
            registrar,
        }
    }

    /// Registers an agent whose total equals its advertised resources and
    /// on which nothing is in use.
    pub fn add_agent(&self, slave_id: SlaveId, info: &SlaveInfo) {
        self.allocator
            .add_slave(slave_id, info.clone(), info.resources.clone(), HashMap::new())
            .expect("allocator stopped");
    }

    /// Registers a framework that holds nothing yet.
    pub fn add_framework(&self, framework_id: FrameworkId, info: &FrameworkInfo) {
        self.allocator
            .add_framework(framework_id, info.clone(), HashMap::new())
            .expect("allocator stopped");
    }

    /// Lets the allocator work through its mailbox.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
