//! Operator-visible warning channels.

/// Which consumer is asking; the RPC surface suppresses the generic
/// pre-release banner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WarningChannel {
    StatusBar,
    Rpc,
}

/// Priority-ranked warning sources; the highest non-empty one wins.
#[derive(Clone, Debug, Default)]
pub struct Warnings {
    misc: String,
    invalid_chain_found: bool,
    large_fork_found: bool,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_misc(&mut self, warning: impl Into<String>) {
        self.misc = warning.into();
    }

    pub fn set_large_fork_found(&mut self, found: bool) {
        self.large_fork_found = found;
    }

    pub fn set_invalid_chain_found(&mut self, found: bool) {
        self.invalid_chain_found = found;
    }

    pub fn get(&self, channel: WarningChannel) -> String {
        let _ = channel;
        let mut priority = 0;
        let mut message = String::new();

        if !self.misc.is_empty() && priority < 1000 {
            priority = 1000;
            message = self.misc.clone();
        }
        if self.large_fork_found && priority < 2000 {
            priority = 2000;
            message = "Warning: the network does not appear to fully agree! Some miners appear to be experiencing issues.".to_string();
        }
        if self.invalid_chain_found && priority < 2500 {
            message = "Warning: we do not appear to fully agree with our peers! You may need to upgrade, or other nodes may need to upgrade.".to_string();
        }
        message
    }
}
