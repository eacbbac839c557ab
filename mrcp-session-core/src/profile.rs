//! Profile (spec.md §6): the read-only configuration value attached at
//! session creation.

use std::collections::HashMap;
use std::sync::Arc;

use mrcp_media_core::MediaEngine;

use crate::channel::{ConnectionAgent, ResourceEngine};
use crate::rtp::RtpTerminationFactory;

/// A single entry in the resource factory: the static facts about a named
/// resource, independent of any engine implementation.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub name: String,
}

/// `name -> resource descriptor` (spec.md §6 "Profile").
pub type ResourceFactory = HashMap<String, ResourceDescriptor>;

/// `resource name -> resource-engine handle` (spec.md §6 "Profile").
pub type EngineTable = HashMap<String, Arc<dyn ResourceEngine>>;

/// The set of resource engines, the connection agent, the media engine,
/// and the RTP termination factory a session is built against. Immutable
/// once constructed, shared across every session that uses it.
pub struct Profile {
    pub resource_factory: ResourceFactory,
    pub engine_table: EngineTable,
    pub connection_agent: Arc<dyn ConnectionAgent>,
    pub media_engine: MediaEngine,
    pub rtp_termination_factory: Arc<dyn RtpTerminationFactory>,
    /// Upper bound on terminations per session (spec.md §4.1 step 1
    /// "capacity 5 (default upper bound)").
    pub context_capacity: usize,
}

/// Builds a [`Profile`] incrementally, panicking at `build()` if a
/// required collaborator was never supplied.
pub struct ProfileBuilder {
    resource_factory: ResourceFactory,
    engine_table: EngineTable,
    connection_agent: Option<Arc<dyn ConnectionAgent>>,
    media_engine: Option<MediaEngine>,
    rtp_termination_factory: Option<Arc<dyn RtpTerminationFactory>>,
    context_capacity: usize,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self {
            resource_factory: HashMap::new(),
            engine_table: HashMap::new(),
            connection_agent: None,
            media_engine: None,
            rtp_termination_factory: None,
            context_capacity: 5,
        }
    }

    pub fn with_resource(mut self, name: impl Into<String>, engine: Arc<dyn ResourceEngine>) -> Self {
        let name = name.into();
        self.resource_factory.insert(name.clone(), ResourceDescriptor { name: name.clone() });
        self.engine_table.insert(name, engine);
        self
    }

    pub fn with_connection_agent(mut self, agent: Arc<dyn ConnectionAgent>) -> Self {
        self.connection_agent = Some(agent);
        self
    }

    pub fn with_media_engine(mut self, engine: MediaEngine) -> Self {
        self.media_engine = Some(engine);
        self
    }

    pub fn with_rtp_termination_factory(mut self, factory: Arc<dyn RtpTerminationFactory>) -> Self {
        self.rtp_termination_factory = Some(factory);
        self
    }

    pub fn with_context_capacity(mut self, capacity: usize) -> Self {
        self.context_capacity = capacity;
        self
    }

    /// Finish building. Panics if a required collaborator was never
    /// supplied — a `Profile` with no connection agent, media engine, or
    /// RTP factory cannot service any offer, so failing fast at
    /// construction time (rather than deep inside offer processing) is
    /// the only sane contract here.
    pub fn build(self) -> Profile {
        Profile {
            resource_factory: self.resource_factory,
            engine_table: self.engine_table,
            connection_agent: self.connection_agent.expect("connection agent is required"),
            media_engine: self.media_engine.expect("media engine is required"),
            rtp_termination_factory: self.rtp_termination_factory.expect("RTP termination factory is required"),
            context_capacity: self.context_capacity,
        }
    }
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
