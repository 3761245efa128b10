pub mod api_keys;
pub mod directory;
pub mod dispatcher;
pub mod model_registry;
pub mod placement;
pub mod presence;
pub mod session_authority;

#[cfg(test)]
pub(crate) mod test_support;

pub use api_keys::{ApiKeyManager, ClientIdentity, Permission};
pub use directory::{Candidates, SlotReservation, WorkerDirectory, WorkerRecord};
pub use dispatcher::{Assignment, DispatchError, Dispatcher};
pub use model_registry::{ModelRegistry, RegistryError};
pub use placement::{HttpPlacement, ModelPlacement, PlacementError};
pub use presence::presence_monitor;
pub use session_authority::{SessionAuthority, SessionCredential, SessionError, SessionPolicy};
