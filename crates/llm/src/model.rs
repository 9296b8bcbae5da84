#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-pro";

pub fn default_gemini_models() -> Vec<Model> {
    vec![
        Model::from_id(DEFAULT_GEMINI_MODEL).with_description("General purpose default"),
        Model::from_id("gemini-1.5-flash").with_description("Lower latency, lower cost"),
        Model::from_id("gemini-2.0-flash").with_description("Newer fast model"),
    ]
}

/// Whether `model_id` names one of the built-in models.
pub fn is_known_gemini_model(model_id: &str) -> bool {
    default_gemini_models()
        .iter()
        .any(|model| model.id == model_id.trim())
}
