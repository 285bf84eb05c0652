//! Graph builder: runs the processors over the store in order.

use std::fmt;

use tracing::debug;

use super::extension::ExtensionServiceProcessor;
use super::gatewayapi::GatewayApiProcessor;
use super::httpproxy::HttpProxyProcessor;
use super::ingress::IngressProcessor;
use super::listener::ListenerProcessor;
use super::status::{StatusAccumulator, StatusUpdate};
use super::Dag;
use crate::config::{Config, ProcessorKind};
use crate::store::ResourceStore;

/// One stage of the graph build.
///
/// Processors never fail the build: invalid input is left out of the graph
/// and reported through `status`.
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, dag: &mut Dag, store: &ResourceStore, status: &mut StatusAccumulator);
}

/// Runs an ordered list of processors.
pub struct Builder {
    processors: Vec<Box<dyn Processor>>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder").field("processors", &self.processor_names()).finish()
    }
}

impl Builder {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// Processors in the configured order.
    pub fn from_config(config: &Config) -> Self {
        let processors = config
            .processor_order()
            .into_iter()
            .map(|kind| -> Box<dyn Processor> {
                match kind {
                    ProcessorKind::Listener => Box::new(ListenerProcessor::from_config(config)),
                    ProcessorKind::Ingress => Box::new(IngressProcessor::from_config(config)),
                    ProcessorKind::HttpProxy => Box::new(HttpProxyProcessor::from_config(config)),
                    ProcessorKind::ExtensionService => {
                        Box::new(ExtensionServiceProcessor::from_config(config))
                    }
                    ProcessorKind::GatewayApi => Box::new(GatewayApiProcessor::from_config(config)),
                }
            })
            .collect();
        Self::new(processors)
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Build the graph and the status of every object the processors saw.
    pub fn build(&self, store: &ResourceStore) -> (Dag, Vec<StatusUpdate>) {
        let mut dag = Dag::default();
        let mut status = StatusAccumulator::new();
        for processor in &self.processors {
            processor.run(&mut dag, store, &mut status);
            debug!(processor = processor.name(), listeners = dag.listeners.len(), "Processor finished");
        }
        dag.remove_empty_virtual_hosts();
        (dag, status.into_updates())
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{Kind, ObjectKey};

    struct Marker;

    impl Processor for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }

        fn run(&self, _dag: &mut Dag, _store: &ResourceStore, status: &mut StatusAccumulator) {
            status.touch(&ObjectKey::new(Kind::Service, "default", "marker"));
        }
    }

    #[test]
    fn default_order() {
        let builder = Builder::default();
        assert_eq!(
            builder.processor_names(),
            vec!["listener", "ingress", "httpproxy", "extensionservice", "gatewayapi"]
        );
    }

    #[test]
    fn custom_processors_run() {
        let builder = Builder::new(vec![Box::new(Marker)]);
        let (dag, updates) = builder.build(&ResourceStore::default());
        assert!(dag.listeners.is_empty());
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].key.name, "marker");
    }

    #[test]
    fn empty_store_builds_default_listeners() {
        let (dag, updates) = Builder::default().build(&ResourceStore::default());
        assert!(updates.is_empty());
        assert!(dag.listeners.contains_key("ingress_http"));
        assert!(dag.listeners.contains_key("ingress_https"));
    }
}
