//! What happens once an alarm rings: the dismissal state machine, fuzzy
//! voice matching and the coordinator that settles each firing.

pub mod coordinator;
pub mod machine;
pub mod matcher;

pub use coordinator::{DismissalCoordinator, DismissalError, RingingAlarm};
pub use machine::{
    transition, DismissalInput, DismissalState, DismissalStateMachine, DismissalTiming, Resolution, UserAction,
};
pub use matcher::{levenshtein, normalize, KeywordMatch, VoiceMatcher};
