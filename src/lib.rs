pub mod core;
pub mod types;

// Re-export main types
pub mod prelude {
    pub use crate::core::class_db::*;
    pub use crate::core::error::{ExtResult, ExtensionError};
    pub use crate::core::frame::*;
    pub use crate::core::init::*;
    pub use crate::core::interface::*;
    pub use crate::core::registry::*;
    pub use crate::core::tracker::*;
    pub use crate::types::builtins::*;
    pub use crate::types::engine_ptr::*;
    pub use crate::types::enums::*;
    pub use crate::types::variant::*;
}
