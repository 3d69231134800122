// souk-test-utils: Test doubles for the gateway integration suites.
//
// `MockRedisServer` speaks enough RESP2 to stand in for a real Redis
// (strings, hashes, lists, sorted sets, MULTI/EXEC, pub/sub and the
// keyspace notifications the gateway relies on).  `TestClient` is a thin
// WebSocket JSON client.

pub mod mock_redis;
pub mod ws_client;

pub use mock_redis::MockRedisServer;
pub use ws_client::TestClient;
