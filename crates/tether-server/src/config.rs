use tether::DistanceRings;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    /// Per-player replication pool size.
    pub queue_capacity: usize,
    pub interest_cell_size: f32,
    pub rings: DistanceRings,
    pub client_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_clients: 32,
            queue_capacity: 256,
            interest_cell_size: 32.0,
            rings: DistanceRings::default(),
            client_timeout_secs: 30,
        }
    }
}
