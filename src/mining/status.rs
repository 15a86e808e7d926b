use serde::Serialize;

/// Composite mining status derived from the two activity flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MiningStatus {
    #[default]
    Idle,
    ActiveOnly,
    PassiveOnly,
    Both,
}

impl MiningStatus {
    pub fn from_flags(active: bool, passive: bool) -> Self {
        match (active, passive) {
            (false, false) => MiningStatus::Idle,
            (true, false) => MiningStatus::ActiveOnly,
            (false, true) => MiningStatus::PassiveOnly,
            (true, true) => MiningStatus::Both,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MiningStatus::Idle => "idle",
            MiningStatus::ActiveOnly => "mining (active)",
            MiningStatus::PassiveOnly => "mining (passive)",
            MiningStatus::Both => "mining (active + passive)",
        }
    }
}

/// The two independent activity flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivityFlags {
    pub active: bool,
    pub passive: bool,
}

impl ActivityFlags {
    pub fn status(&self) -> MiningStatus {
        MiningStatus::from_flags(self.active, self.passive)
    }

    pub fn toggle_active(&mut self) -> MiningStatus {
        self.active = !self.active;
        self.status()
    }

    pub fn toggle_passive(&mut self) -> MiningStatus {
        self.passive = !self.passive;
        self.status()
    }
}
