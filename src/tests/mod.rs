// Test modules for natprobe
// Each module exercises one component over real loopback sockets

mod protocol_tests;
mod responder_tests;
