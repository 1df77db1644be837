pub mod service;
pub mod types;

pub use service::TutorService;
pub use types::{
    ChatTurnRequest, Exercise, ExerciseSet, ExerciseSetRequest, GeneratedImage, ImageRequest,
    ProficiencyLevel, RoleplayRequest, RoleplayTurn, SpeechClip, SpeechRequest, Summary,
    SummaryRequest, Translation, TranslationRequest, TurnMessage, TurnRole, TutorTurn,
};
