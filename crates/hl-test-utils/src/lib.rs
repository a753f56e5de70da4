// hl-test-utils: shared fixtures for socket-level tests.

mod mock_dev_server;

pub use mock_dev_server::{HandshakeBehavior, MockDevServer, MockServerOptions};
