mod abuse;
mod toxicity;

pub use abuse::{
    AbuseAction, AbuseKey, AbuseRecord, AbuseTracker, MuteStatus, MutePolicy, MutedUser, RecordOutcome,
    RoomStats, UserStats,
};
pub use toxicity::{
    score_or_default, ClassifierError, DisabledClassifier, HttpClassifier, ToxicityClassifier, ToxicityLevel,
    ToxicityScores, TOXIC_CUTOFF,
};
