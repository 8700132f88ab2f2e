use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::types::CompiledConfig;

/// Atomic snapshot of the compiled configuration. Serving tasks load a
/// snapshot per request and keep it for the request's lifetime; the
/// control task swaps in re-compiled configurations.
#[derive(Clone)]
pub struct Stores {
	current: Arc<ArcSwap<CompiledConfig>>,
}

impl Stores {
	pub fn new(initial: Arc<CompiledConfig>) -> Self {
		Stores {
			current: Arc::new(ArcSwap::from(initial)),
		}
	}

	pub fn snapshot(&self) -> Arc<CompiledConfig> {
		self.current.load_full()
	}

	pub fn swap(&self, next: Arc<CompiledConfig>) {
		self.current.store(next);
	}
}
