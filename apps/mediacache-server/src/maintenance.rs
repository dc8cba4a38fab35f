use crate::tasks::{spawn_supervised, TaskHandle};
use mediacache_core::Janitor;

/// Starts the janitor loop under supervision.
pub(crate) fn start(janitor: Janitor) -> TaskHandle {
    spawn_supervised("cache.janitor", move || janitor.clone().run())
}
