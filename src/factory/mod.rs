/// 连接工厂
///
/// 客户端工厂负责缓存和建立连接，服务端工厂负责接受连接；两者都实现
/// [`ConnectionManager`](crate::connection::ConnectionManager)，连接关闭时回调移除。

mod multimap;

pub mod datagram;
pub mod incoming;
pub mod outgoing;
pub mod stream;

pub use datagram::DatagramIncomingConnectionFactory;
pub use incoming::{create_incoming_factory, IncomingConnectionFactory};
pub use outgoing::{CacheStats, OutgoingConnectionFactory};
pub use stream::StreamIncomingConnectionFactory;
