pub mod client;
pub mod delivery;
pub mod mime;

pub use client::{run_room, save_received, ClientOptions, RoomAction};
pub use delivery::Deliveries;
pub use mime::mime_for_path;
