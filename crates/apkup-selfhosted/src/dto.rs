use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CurrentReleaseDto {
    pub release_id: String,
    pub tag: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub apps: Vec<PublishedAppDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PublishedAppDto {
    pub package_name: String,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub file_name: String,
    pub download_url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DebugDto {
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
}

impl DebugDto {
    pub(crate) fn summary(&self) -> String {
        if !self.ok {
            return format!(
                "Connection KO: {}",
                self.message.as_deref().unwrap_or("source unavailable")
            );
        }

        let details: Vec<&str> = [&self.message, &self.tag, &self.release]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.trim().is_empty())
            .collect();
        if details.is_empty() {
            "Connection OK".to_string()
        } else {
            format!("Connection OK: {}", details.join(" / "))
        }
    }
}
