// =============================================================================
// API — REST command surface and the viewer WebSocket
// =============================================================================

pub mod rest;
pub mod ws;
