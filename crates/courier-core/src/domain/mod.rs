//! Domain model: delivery error taxonomy and item ids.

pub mod errors;
pub mod ids;

pub use self::errors::{DeliveryError, ErrorKind};
pub use self::ids::{file_stem, generate_item_id};
