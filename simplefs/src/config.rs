/// Maximum number of files the server keeps open at once.
pub const MAX_OPEN: usize = 1024;

/// Device tag written into descriptors handed out by the server.
pub const DEV_FILE: u32 = b'f' as u32;

/// Tunables for a file server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub max_open: usize,
    pub dev_id: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_open: MAX_OPEN,
            dev_id: DEV_FILE,
        }
    }
}

impl ServerConfig {
    /// # Panics
    ///
    /// At least one handle is required.
    pub fn with_max_open(mut self, max_open: usize) -> Self {
        assert!(max_open > 0, "max_open must be positive");
        self.max_open = max_open;
        self
    }

    pub fn with_dev_id(mut self, dev_id: u32) -> Self {
        self.dev_id = dev_id;
        self
    }
}
