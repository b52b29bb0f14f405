//! The wire vocabulary that is used consistently across the server and the clients.
//! Contains the message type names, the JSON envelope handling, the payload
//! structures and the maze data model that travels both over the socket
//! (`maze_data`) and to disk (`maze_data.json`).

pub mod items;
pub mod maze;
pub mod messages;

pub use items::ItemKind;
pub use maze::{CellKind, CoinSpot, FloatPos, GridPos, MazeData};
pub use messages::*;

/// The buffer size of the per-connection outbound queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Longest accepted text payload in a single frame. Anything above closes the connection.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Chat messages are cut off at this many code points.
pub const CHAT_MESSAGE_LIMIT: usize = 200;
