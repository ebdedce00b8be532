use crate::FuConfig;

/// Everything the passes need besides the graph itself: the functional-unit
/// table and the extra options passed to individual passes.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Functional-unit cost/latency table.
    pub config: FuConfig,
    /// Pass options in the form `pass:opt` or `pass:opt=value`.
    pub extra_opts: Vec<String>,
}

impl Context {
    pub fn new(config: FuConfig) -> Self {
        Context {
            config,
            extra_opts: Vec::new(),
        }
    }

    /// Add a pass option such as `bind:share-fu=false`.
    pub fn with_opt<S: ToString>(mut self, opt: S) -> Self {
        self.extra_opts.push(opt.to_string());
        self
    }
}
