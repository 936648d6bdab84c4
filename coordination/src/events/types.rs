//! Stream event types.
//!
//! `stage` and `status` are the stable contract consumed by clients; the
//! payload is stage-specific JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::participants::ParticipantRole;

/// Pipeline stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Classify,
    Prefetch,
    /// Activity of one participant.
    Agent(ParticipantRole),
    Debate,
    DebateTurn,
    Critique,
    Verify,
    Synthesize,
    Done,
    Error,
    Heartbeat,
}

impl Stage {
    /// Stage name without the agent role suffix.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Prefetch => "prefetch",
            Self::Agent(_) => "agent",
            Self::Debate => "debate",
            Self::DebateTurn => "debate:turn",
            Self::Critique => "critique",
            Self::Verify => "verify",
            Self::Synthesize => "synthesize",
            Self::Done => "done",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(role) => write!(f, "agent:{}", role),
            other => f.write_str(other.family()),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(role) = s.strip_prefix("agent:") {
            return role.parse::<ParticipantRole>().map(Self::Agent);
        }
        match s {
            "classify" => Ok(Self::Classify),
            "prefetch" => Ok(Self::Prefetch),
            "debate" => Ok(Self::Debate),
            "debate:turn" => Ok(Self::DebateTurn),
            "critique" => Ok(Self::Critique),
            "verify" => Ok(Self::Verify),
            "synthesize" => Ok(Self::Synthesize),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "heartbeat" => Ok(Self::Heartbeat),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

impl Serialize for Stage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ready,
    Running,
    Streaming,
    Complete,
    Error,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Streaming => write!(f, "streaming"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One ordered event on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Assigned by the bus on publish; strictly increasing per bus.
    pub seq: u64,
    pub session_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(
        session_id: impl Into<String>,
        stage: Stage,
        status: StageStatus,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            seq: 0,
            session_id: session_id.into(),
            stage,
            status,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Terminal events end a run's stream.
    pub fn is_terminal(&self) -> bool {
        self.stage == Stage::Done
    }

    /// `"<stage>/<status>"`, handy in logs and assertions.
    pub fn label(&self) -> String {
        format!("{}/{}", self.stage, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_strings() {
        assert_eq!(Stage::Agent(ParticipantRole::RiskAnalyst).to_string(), "agent:risk_analyst");
        assert_eq!(Stage::DebateTurn.to_string(), "debate:turn");
        assert_eq!("agent:quant".parse::<Stage>().unwrap(), Stage::Agent(ParticipantRole::Quant));
        assert_eq!("debate:turn".parse::<Stage>().unwrap(), Stage::DebateTurn);
        assert!("agent:moderator".parse::<Stage>().is_err());
        assert!("render".parse::<Stage>().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let event = StreamEvent::new(
            "s-1",
            Stage::Agent(ParticipantRole::Skeptic),
            StageStatus::Streaming,
            serde_json::json!({"turn_index": 3}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "agent:skeptic");
        assert_eq!(json["status"], "streaming");
        assert_eq!(json["payload"]["turn_index"], 3);

        let back: StreamEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.label(), "agent:skeptic/streaming");
    }
}
