use crate::protocol::LineEnding;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// When set, every task sent or received must be a JSON object.
    pub json_mode: bool,
    pub connect_timeout: Duration,
    /// Ceiling on how long `get_task` waits for the server's reply.
    pub response_timeout: Duration,
    /// How long `schedule_task` listens for a late transport error before
    /// assuming the write went through.
    pub schedule_grace: Duration,
    /// Pause before the reconnect attempt that masks a transport failure.
    pub retry_delay: Duration,
    pub line_ending: LineEnding,
}

impl Config {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1337,
            json_mode: false,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_millis(5000),
            schedule_grace: Duration::from_millis(1000),
            retry_delay: Duration::ZERO,
            line_ending: LineEnding::Newline,
        }
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.config.json_mode = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.config.response_timeout = Duration::from_millis(ms);
        self
    }

    pub fn schedule_grace(mut self, grace: Duration) -> Self {
        self.config.schedule_grace = grace;
        self
    }

    pub fn schedule_grace_ms(mut self, ms: u64) -> Self {
        self.config.schedule_grace = Duration::from_millis(ms);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay = Duration::from_millis(ms);
        self
    }

    pub fn line_ending(mut self, line_ending: LineEnding) -> Self {
        self.config.line_ending = line_ending;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
