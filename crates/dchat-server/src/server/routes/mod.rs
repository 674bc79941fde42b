// Route modules for the dChat server
pub mod presence; // Online user queries
pub mod websocket; // Authenticated upgrade into the real-time hub
