// souk-redis: RESP2 plumbing for the gateway worker.
//
// Bottom up:
//   codec   -- framing and parsing of RESP2 replies
//   cmd     -- command encoders
//   session -- one reconnecting, pipelined TCP connection (actor + handle)
//   facade  -- the four-connection facade the worker talks to

pub mod cmd;
pub mod codec;
pub mod facade;
pub mod session;
