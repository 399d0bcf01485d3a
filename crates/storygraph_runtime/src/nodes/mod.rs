// Standard node library.
//
// Concrete node behaviors built on the engine core: graph IO markers,
// container and string manipulation, arithmetic, branching, and state
// scope access.

pub mod core;
pub mod data;
pub mod logic;
pub mod number;
pub mod state;
pub mod string;
pub mod util;

use crate::error::NodeError;
use crate::registry::Registry;

pub fn register_all(registry: &Registry) -> Result<(), NodeError> {
    core::register(registry)?;
    data::register(registry)?;
    string::register(registry)?;
    number::register(registry)?;
    logic::register(registry)?;
    state::register(registry)?;
    util::register(registry)?;
    Ok(())
}
