pub mod connection;
pub mod dispatcher;
mod endpoint;
pub mod io;
pub mod reactor;

pub use connection::{Connection, ConnectionId, Mode};
pub use dispatcher::Dispatcher;
pub use endpoint::{Client, PeerNode, Server};
pub use io::{ReadReport, SocketIo};
pub use reactor::Reactor;
