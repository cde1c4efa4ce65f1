/*!
# RelayHub DevKit - fakes and harness for agent tests

- In-memory document store with atomic multi-path updates and failure injection
- Recording GPIO driver
- Fixed health probe and counting restarter
- `TestHarness` wiring a full `DeviceAgent` to the fakes
*/

pub mod memory_store;
pub mod mock_gpio;
pub mod test_utils;

pub use memory_store::{MemoryStore, StoreCall};
pub use mock_gpio::RecordingDriver;
pub use test_utils::{FixedProbe, RecordingRestarter, TestHarness};
