/*!
# twinsync DevKit - test doubles for the orchestrator

- Recording executor that answers commands from rules instead of spawning them
- Recording notifier
- Harness wiring both into an [`Orchestrator`](twinsync_agent::Orchestrator)
  with throwaway state paths and no delays
*/

pub mod mock_executor;
pub mod notifier;
pub mod test_utils;

pub use mock_executor::{MockExecutor, RecordedCommand};
pub use notifier::{Notification, RecordingNotifier};
pub use test_utils::{TestHarness, PEER_ADDRESS};
