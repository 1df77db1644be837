use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::error::{Error, Result};
use crate::models::credentials::CredentialPool;
use crate::models::fallback::{ModelChain, OrchestratorConfig, RetryOrchestrator};
use crate::models::provider::{Feature, ProviderAdapter, ProviderPayload, RawResponse};
use crate::storage::CreditLedger;
use crate::tutor::types::{
    ChatTurnRequest, Exercise, ExerciseSet, ExerciseSetRequest, GeneratedImage, ImageRequest,
    RoleplayRequest, RoleplayTurn, SpeechClip, SpeechRequest, Summary, SummaryRequest, Translation,
    TranslationRequest, TutorTurn,
};

/// The only layer the UI calls. Every feature funnels through the same
/// pipeline: admit against the ledger, run the retry orchestrator, charge
/// one credit on provider success, then parse the raw payload. A parse
/// failure after a delivered response surfaces as `MalformedResponse` with
/// the charge kept, since transport success is what is metered.
pub struct TutorService {
    ledger: Arc<CreditLedger>,
    adapter: Arc<dyn ProviderAdapter>,
    orchestrator: RetryOrchestrator,
}

impl TutorService {
    pub fn new(state: &AppState) -> Self {
        Self::with_parts(
            state.ledger(),
            state.adapter(),
            state.credential_pool(),
            state.model_chain(),
            state.orchestrator_config(),
        )
    }

    pub fn with_parts(
        ledger: Arc<CreditLedger>,
        adapter: Arc<dyn ProviderAdapter>,
        pool: Arc<CredentialPool>,
        chain: Arc<ModelChain>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            adapter,
            orchestrator: RetryOrchestrator::new(pool, chain, config),
        }
    }

    pub async fn send_chat_turn(&self, user_id: &str, request: ChatTurnRequest) -> Result<TutorTurn> {
        let payload = ProviderPayload::new(Feature::ChatTurn, chat_body(&request));
        self.run_feature(user_id, payload, parse_tutor_turn).await
    }

    pub async fn translate(&self, user_id: &str, request: TranslationRequest) -> Result<Translation> {
        let payload = ProviderPayload::new(Feature::Translation, translation_body(&request));
        self.run_feature(user_id, payload, parse_translation).await
    }

    pub async fn summarize(&self, user_id: &str, request: SummaryRequest) -> Result<Summary> {
        let payload = ProviderPayload::new(Feature::Summary, summary_body(&request));
        self.run_feature(user_id, payload, parse_summary).await
    }

    pub async fn synthesize_speech(&self, user_id: &str, request: SpeechRequest) -> Result<SpeechClip> {
        let payload = ProviderPayload::new(Feature::Speech, speech_body(&request));
        self.run_feature(user_id, payload, parse_speech).await
    }

    pub async fn generate_image(&self, user_id: &str, request: ImageRequest) -> Result<GeneratedImage> {
        let payload = ProviderPayload::new(Feature::Image, image_body(&request));
        self.run_feature(user_id, payload, parse_image).await
    }

    pub async fn generate_exercise_set(
        &self,
        user_id: &str,
        request: ExerciseSetRequest,
    ) -> Result<ExerciseSet> {
        let payload = ProviderPayload::new(Feature::ExerciseSet, exercise_body(&request));
        self.run_feature(user_id, payload, parse_exercise_set).await
    }

    pub async fn roleplay_turn(&self, user_id: &str, request: RoleplayRequest) -> Result<RoleplayTurn> {
        let payload = ProviderPayload::new(Feature::Roleplay, roleplay_body(&request));
        self.run_feature(user_id, payload, parse_roleplay_turn).await
    }

    async fn run_feature<T, P>(&self, user_id: &str, payload: ProviderPayload, parse: P) -> Result<T>
    where
        P: FnOnce(&RawResponse) -> Result<T>,
    {
        self.ledger.check_admission(user_id).await?;

        let adapter = &self.adapter;
        let feature = payload.feature;
        let (raw, attempts) = self
            .orchestrator
            .execute(|model, credential| {
                let adapter = adapter.clone();
                let payload = payload.clone();
                async move { adapter.call(&model, &credential, payload).await }
            })
            .await?;

        debug!(
            feature = feature.as_str(),
            attempts = attempts.len(),
            model = %raw.model,
            "provider call settled"
        );

        let balance = self.ledger.deduct(user_id).await?;
        debug!(user_id, balance, "charged one credit");

        // The balance column is the source of truth; a lost event is only a
        // gap in history.
        if let Err(e) = self
            .ledger
            .record_usage(user_id, &raw.request_id, feature.as_str(), &raw.model)
            .await
        {
            warn!(user_id, error = %e, "failed to record usage event");
        }

        parse(&raw)
    }
}

fn chat_body(request: &ChatTurnRequest) -> serde_json::Value {
    let mut messages = vec![json!({
        "role": "system",
        "content": format!(
            "You are a friendly {lang} tutor. Answer in {lang}, keep replies short, and gently correct the learner's mistakes.",
            lang = request.target_language
        ),
    })];
    for turn in &request.history {
        messages.push(json!({"role": turn.role.as_wire(), "content": turn.content}));
    }
    messages.push(json!({"role": "user", "content": request.message}));

    json!({"messages": messages})
}

fn translation_body(request: &TranslationRequest) -> serde_json::Value {
    let source = request
        .source_language
        .as_deref()
        .unwrap_or("the source language, detecting it yourself");

    json!({
        "messages": [
            {
                "role": "system",
                "content": format!(
                    "Translate from {} into {}. Reply with the translation only.",
                    source, request.target_language
                ),
            },
            {"role": "user", "content": request.text},
        ],
    })
}

fn summary_body(request: &SummaryRequest) -> serde_json::Value {
    let length = match request.max_sentences {
        Some(n) => format!("at most {} sentences", n),
        None => "a short paragraph".to_string(),
    };

    json!({
        "messages": [
            {
                "role": "system",
                "content": format!(
                    "Summarize the learner's text in {} using {}.",
                    request.language, length
                ),
            },
            {"role": "user", "content": request.text},
        ],
    })
}

fn speech_body(request: &SpeechRequest) -> serde_json::Value {
    json!({
        "input": request.text,
        "language": request.language,
        "voice": request.voice.as_deref().unwrap_or("nova"),
        "response_format": "mp3",
    })
}

fn image_body(request: &ImageRequest) -> serde_json::Value {
    json!({
        "prompt": request.prompt,
        "size": request.size.as_deref().unwrap_or("1024x1024"),
        "response_format": "b64_json",
        "n": 1,
    })
}

fn exercise_body(request: &ExerciseSetRequest) -> serde_json::Value {
    json!({
        "messages": [
            {
                "role": "system",
                "content": format!(
                    "Create {} {} vocabulary exercises about \"{}\" for a {} learner. \
                     Reply with only a JSON array of objects with fields \"prompt\" and \"answer\".",
                    request.count,
                    request.language,
                    request.topic,
                    request.level.as_str()
                ),
            },
        ],
    })
}

fn roleplay_body(request: &RoleplayRequest) -> serde_json::Value {
    let mut messages = vec![json!({
        "role": "system",
        "content": format!(
            "Roleplay scenario: {}. Stay in character as {} and speak only {}.",
            request.scenario, request.persona, request.target_language
        ),
    })];
    for turn in &request.history {
        messages.push(json!({"role": turn.role.as_wire(), "content": turn.content}));
    }
    messages.push(json!({"role": "user", "content": request.message}));

    json!({"messages": messages})
}

fn completion_text(raw: &RawResponse) -> Result<String> {
    raw.body
        .pointer("/choices/0/message/content")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::malformed_response("missing choices[0].message.content"))
}

fn parse_tutor_turn(raw: &RawResponse) -> Result<TutorTurn> {
    Ok(TutorTurn {
        reply: completion_text(raw)?,
        model: raw.model.clone(),
        usage: raw.usage,
        request_id: raw.request_id.clone(),
    })
}

fn parse_translation(raw: &RawResponse) -> Result<Translation> {
    Ok(Translation {
        translated_text: completion_text(raw)?,
        model: raw.model.clone(),
    })
}

fn parse_summary(raw: &RawResponse) -> Result<Summary> {
    Ok(Summary {
        summary: completion_text(raw)?,
        model: raw.model.clone(),
    })
}

fn parse_speech(raw: &RawResponse) -> Result<SpeechClip> {
    let audio = raw
        .body
        .get("audio")
        .and_then(|value| value.as_str())
        .ok_or_else(|| Error::malformed_response("missing audio payload"))?;
    let format = raw
        .body
        .get("format")
        .and_then(|value| value.as_str())
        .unwrap_or("mp3");

    Ok(SpeechClip {
        audio_base64: audio.to_string(),
        format: format.to_string(),
        model: raw.model.clone(),
    })
}

fn parse_image(raw: &RawResponse) -> Result<GeneratedImage> {
    let image = raw
        .body
        .pointer("/data/0/b64_json")
        .and_then(|value| value.as_str())
        .ok_or_else(|| Error::malformed_response("missing data[0].b64_json"))?;

    Ok(GeneratedImage {
        image_base64: image.to_string(),
        model: raw.model.clone(),
    })
}

fn parse_exercise_set(raw: &RawResponse) -> Result<ExerciseSet> {
    let text = completion_text(raw)?;
    let exercises: Vec<Exercise> = serde_json::from_str(&text)
        .map_err(|e| Error::malformed_response(format!("exercise list is not valid JSON: {}", e)))?;

    Ok(ExerciseSet {
        exercises,
        model: raw.model.clone(),
    })
}

fn parse_roleplay_turn(raw: &RawResponse) -> Result<RoleplayTurn> {
    Ok(RoleplayTurn {
        reply: completion_text(raw)?,
        model: raw.model.clone(),
        usage: raw.usage,
        request_id: raw.request_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credentials::Credential;
    use crate::models::fallback::ModelDescriptor;
    use crate::models::provider::{ProviderError, TokenUsage};
    use crate::platform::AppPaths;
    use crate::storage::{AccountRole, Database};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    type Responder = dyn Fn(&ModelDescriptor, &Credential, usize) -> std::result::Result<RawResponse, ProviderError>
        + Send
        + Sync;

    struct StubAdapter {
        calls: AtomicUsize,
        respond: Box<Responder>,
    }

    impl StubAdapter {
        fn new<F>(respond: F) -> Arc<Self>
        where
            F: Fn(&ModelDescriptor, &Credential, usize) -> std::result::Result<RawResponse, ProviderError>
                + Send
                + Sync
                + 'static,
        {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                respond: Box::new(respond),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        async fn call(
            &self,
            model: &ModelDescriptor,
            credential: &Credential,
            _payload: ProviderPayload,
        ) -> std::result::Result<RawResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(model, credential, n)
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn completion_response(model: &str, text: &str) -> RawResponse {
        RawResponse {
            request_id: "req-test".to_string(),
            model: model.to_string(),
            body: json!({"choices": [{"message": {"role": "assistant", "content": text}}]}),
            usage: Some(TokenUsage::new(10, 5)),
            received_at: Utc::now(),
        }
    }

    fn body_response(model: &str, body: serde_json::Value) -> RawResponse {
        RawResponse {
            request_id: "req-test".to_string(),
            model: model.to_string(),
            body,
            usage: None,
            received_at: Utc::now(),
        }
    }

    async fn test_ledger() -> (Arc<CreditLedger>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        paths.ensure_dirs_exist().unwrap();
        let db = Database::new(&paths).await.unwrap();
        (Arc::new(CreditLedger::new(db.get_pool())), temp_dir)
    }

    fn test_service(
        ledger: Arc<CreditLedger>,
        adapter: Arc<StubAdapter>,
        credentials: usize,
        models: &[&str],
    ) -> TutorService {
        let secrets = (0..credentials).map(|i| format!("sk-test-{}", i)).collect();
        let pool = Arc::new(CredentialPool::with_start(secrets, 0).unwrap());
        let chain = Arc::new(
            ModelChain::new(
                models[0].to_string(),
                models[1..].iter().map(|s| s.to_string()).collect(),
            )
            .unwrap(),
        );
        TutorService::with_parts(ledger, adapter, pool, chain, OrchestratorConfig::default())
    }

    fn chat_request(message: &str) -> ChatTurnRequest {
        ChatTurnRequest {
            history: Vec::new(),
            message: message.to_string(),
            target_language: "German".to_string(),
        }
    }

    // With a zero balance no provider call may ever be observed.
    #[tokio::test]
    async fn test_admission_precedes_cost() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 0, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| Ok(completion_response(&model.name, "Hallo!")));
        let service = test_service(ledger.clone(), adapter.clone(), 1, &["tutor-large"]);

        let result = service.send_chat_turn("u1", chat_request("Hallo")).await;

        assert!(matches!(result, Err(Error::InsufficientCredits)));
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_admin_bypasses_metering() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("root", 0, AccountRole::Admin).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| Ok(completion_response(&model.name, "Hallo!")));
        let service = test_service(ledger.clone(), adapter.clone(), 1, &["tutor-large"]);

        let turn = service.send_chat_turn("root", chat_request("Hallo")).await.unwrap();

        assert_eq!(turn.reply, "Hallo!");
        assert_eq!(adapter.call_count(), 1);
        assert_eq!(ledger.load_account("root").await.unwrap().credit_balance, 0);
    }

    // Balance of one: the first request spends it, the second is denied
    // before any network call.
    #[tokio::test]
    async fn test_last_credit_then_denied() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 1, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| Ok(completion_response(&model.name, "Hallo!")));
        let service = test_service(ledger.clone(), adapter.clone(), 1, &["tutor-large"]);

        service.send_chat_turn("u1", chat_request("Hallo")).await.unwrap();
        assert_eq!(ledger.load_account("u1").await.unwrap().credit_balance, 0);

        let result = service.send_chat_turn("u1", chat_request("Nochmal")).await;
        assert!(matches!(result, Err(Error::InsufficientCredits)));
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ledger_conservation_over_successes() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 3, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| Ok(completion_response(&model.name, "Gut!")));
        let service = test_service(ledger.clone(), adapter, 2, &["tutor-large"]);

        for _ in 0..3 {
            service.send_chat_turn("u1", chat_request("Hallo")).await.unwrap();
        }

        assert_eq!(ledger.load_account("u1").await.unwrap().credit_balance, 0);
    }

    // Exhaustion walks the whole grid and never charges.
    #[tokio::test]
    async fn test_exhaustion_does_not_charge() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 5, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|_, _, _| Err(ProviderError::quota("429 too many requests")));
        let service = test_service(ledger.clone(), adapter.clone(), 3, &["tutor-large", "tutor-small"]);

        let result = service.send_chat_turn("u1", chat_request("Hallo")).await;

        assert!(matches!(result, Err(Error::ProviderExhausted(_))));
        assert_eq!(adapter.call_count(), 6);
        assert_eq!(ledger.load_account("u1").await.unwrap().credit_balance, 5);
    }

    // Transport delivered a response the parser cannot read: the charge
    // stands and the caller sees MalformedResponse.
    #[tokio::test]
    async fn test_parse_failure_after_charge() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 2, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| {
            Ok(completion_response(&model.name, "not json at all"))
        });
        let service = test_service(ledger.clone(), adapter, 1, &["tutor-large"]);

        let request = ExerciseSetRequest {
            topic: "animals".to_string(),
            language: "German".to_string(),
            level: crate::tutor::types::ProficiencyLevel::Beginner,
            count: 5,
        };
        let result = service.generate_exercise_set("u1", request).await;

        assert!(matches!(result, Err(Error::MalformedResponse(_))));
        assert_eq!(ledger.load_account("u1").await.unwrap().credit_balance, 1);
    }

    #[tokio::test]
    async fn test_fallback_then_success_charges_once() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 2, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| {
            if model.position == 0 {
                Err(ProviderError::model_unavailable("model retired"))
            } else {
                Ok(completion_response(&model.name, "Hallo!"))
            }
        });
        let service = test_service(ledger.clone(), adapter.clone(), 1, &["tutor-large", "tutor-small"]);

        let turn = service.send_chat_turn("u1", chat_request("Hallo")).await.unwrap();

        assert_eq!(turn.model, "tutor-small");
        assert_eq!(adapter.call_count(), 2);
        assert_eq!(ledger.load_account("u1").await.unwrap().credit_balance, 1);
    }

    #[tokio::test]
    async fn test_translate_parses_completion() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 1, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| Ok(completion_response(&model.name, "der Hund")));
        let service = test_service(ledger, adapter, 1, &["tutor-large"]);

        let translation = service
            .translate(
                "u1",
                TranslationRequest {
                    text: "the dog".to_string(),
                    source_language: Some("English".to_string()),
                    target_language: "German".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(translation.translated_text, "der Hund");
        assert_eq!(translation.model, "tutor-large");
    }

    #[tokio::test]
    async fn test_summarize_parses_completion() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 1, AccountRole::Member).await.unwrap();

        let adapter =
            StubAdapter::new(|model, _, _| Ok(completion_response(&model.name, "Kurze Fassung.")));
        let service = test_service(ledger, adapter, 1, &["tutor-large"]);

        let summary = service
            .summarize(
                "u1",
                SummaryRequest {
                    text: "Ein langer Text ...".to_string(),
                    language: "German".to_string(),
                    max_sentences: Some(2),
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.summary, "Kurze Fassung.");
    }

    #[tokio::test]
    async fn test_speech_and_image_parsers() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 2, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, n| {
            if n == 0 {
                Ok(body_response(&model.name, json!({"audio": "UklGRg==", "format": "mp3"})))
            } else {
                Ok(body_response(&model.name, json!({"data": [{"b64_json": "aVZC"}]})))
            }
        });
        let service = test_service(ledger, adapter, 1, &["tutor-large"]);

        let clip = service
            .synthesize_speech(
                "u1",
                SpeechRequest {
                    text: "Guten Morgen".to_string(),
                    language: "German".to_string(),
                    voice: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(clip.audio_base64, "UklGRg==");
        assert_eq!(clip.format, "mp3");

        let image = service
            .generate_image(
                "u1",
                ImageRequest {
                    prompt: "a dachshund at a cafe".to_string(),
                    size: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(image.image_base64, "aVZC");
    }

    #[tokio::test]
    async fn test_exercise_set_parses_json_payload() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 1, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| {
            Ok(completion_response(
                &model.name,
                r#"[{"prompt": "cat", "answer": "die Katze"}, {"prompt": "dog", "answer": "der Hund"}]"#,
            ))
        });
        let service = test_service(ledger, adapter, 1, &["tutor-large"]);

        let set = service
            .generate_exercise_set(
                "u1",
                ExerciseSetRequest {
                    topic: "animals".to_string(),
                    language: "German".to_string(),
                    level: crate::tutor::types::ProficiencyLevel::Beginner,
                    count: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(set.exercises.len(), 2);
        assert_eq!(set.exercises[1].answer, "der Hund");
    }

    #[tokio::test]
    async fn test_roleplay_turn() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 1, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| {
            Ok(completion_response(&model.name, "Willkommen! Was darf es sein?"))
        });
        let service = test_service(ledger, adapter, 1, &["tutor-large"]);

        let turn = service
            .roleplay_turn(
                "u1",
                RoleplayRequest {
                    scenario: "ordering at a bakery".to_string(),
                    persona: "the baker".to_string(),
                    history: Vec::new(),
                    message: "Guten Tag!".to_string(),
                    target_language: "German".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(turn.reply, "Willkommen! Was darf es sein?");
        assert!(turn.usage.is_some());
    }

    #[tokio::test]
    async fn test_usage_event_recorded_after_success() {
        let (ledger, _temp_dir) = test_ledger().await;
        ledger.upsert_account("u1", 1, AccountRole::Member).await.unwrap();

        let adapter = StubAdapter::new(|model, _, _| Ok(completion_response(&model.name, "Hallo!")));
        let service = test_service(ledger.clone(), adapter, 1, &["tutor-large"]);

        service.send_chat_turn("u1", chat_request("Hallo")).await.unwrap();

        let events = ledger.usage_history("u1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].feature, "chat_turn");
        assert_eq!(events[0].model, "tutor-large");
    }
}
