//! Extension points for the application shell.

use crate::graph::StreamGraph;
use std::collections::BTreeMap;
use std::fmt;

/// Settings for the source element of a stream sub-graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceOptions {
    /// The URI is fetched over the network.
    pub is_network: bool,
    /// Read-ahead buffer for network sources.
    pub buffer_kb: u32,
    pub user_agent: Option<String>,
    /// Source specific properties set by hooks.
    pub properties: BTreeMap<String, String>,
}

impl SourceOptions {
    /// Default options for a URI.
    pub fn for_uri(uri: &str, network_buffer_kb: u32) -> Self {
        let is_network = uri
            .split_once("://")
            .is_some_and(|(scheme, _)| !matches!(scheme, "file" | "cdda"));
        Self {
            is_network,
            buffer_kb: if is_network { network_buffer_kb } else { 0 },
            ..Self::default()
        }
    }
}

/// An audio filter inserted into a stream sub-graph before its volume stage.
pub trait AudioFilter: Send + fmt::Debug {
    fn name(&self) -> &str;
}

/// Callbacks that let the shell customise how streams are built and reused.
///
/// Every method has a no-op default.
pub trait PlayerHooks: Send + Sync {
    /// Adjust source settings before a stream sub-graph is built.
    fn prepare_source(&self, _uri: &str, _source: &mut SourceOptions) {}

    /// Whether an existing stream for `old_uri` can continue into `new_uri`
    /// without being rebuilt.
    fn can_reuse_stream(&self, _new_uri: &str, _old_uri: &str) -> bool {
        false
    }

    /// Reconfigure a stream that is about to continue into `new_uri`.
    fn reuse_stream(&self, _new_uri: &str, _old_uri: &str, _graph: &mut dyn StreamGraph) {}

    /// Filters to insert into the stream for `uri`.
    fn stream_filters(&self, _uri: &str) -> Vec<Box<dyn AudioFilter>> {
        Vec::new()
    }

    /// Codecs or elements needed to play a stream are missing.
    fn missing_plugins(&self, _details: &[String], _descriptions: &[String]) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl PlayerHooks for NoHooks {}
