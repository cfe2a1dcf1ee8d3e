//! REST API client for a render backend instance.
//!
//! Wraps the Automatic1111 HTTP API (generation, single-image upscaling,
//! PNG info, options, interruption, capability listings) using
//! [`reqwest`].

use std::time::Duration;

use dreamfactory_core::capabilities::{Capabilities, ModelInfo, StyleInfo};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::messages::{
    ControlNetModelList, ControlNetModuleList, ExtraSingleImageRequest, ExtraSingleImageResponse,
    GenerationRequest, GenerationResponse, NamedPathItem, PngInfoResponse, SamplerItem,
    ScriptsResponse, SdModelItem, StyleItem, VaeItem,
};

/// How long a single readiness probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for a single render backend instance.
#[derive(Debug, Clone)]
pub struct SdApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the render backend REST layer.
#[derive(Debug, thiserror::Error)]
pub enum SdApiError {
    /// The HTTP request itself failed (connection refused, reset, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Render backend error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl SdApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:7861`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Whether the API routes are mounted yet.
    ///
    /// While the web UI is still starting, `/sdapi/v1/samplers` answers
    /// `{"detail": "Not Found"}`; any other JSON body means ready.
    pub async fn probe_ready(&self) -> Result<bool, SdApiError> {
        let response = self
            .client
            .get(self.url("/sdapi/v1/samplers"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: serde_json::Value = response.json().await?;
        Ok(body.get("detail").and_then(|d| d.as_str()) != Some("Not Found"))
    }

    // -- generation ---------------------------------------------------------------

    pub async fn txt2img(&self, req: &GenerationRequest) -> Result<GenerationResponse, SdApiError> {
        self.post_json("/sdapi/v1/txt2img", req).await
    }

    pub async fn img2img(&self, req: &GenerationRequest) -> Result<GenerationResponse, SdApiError> {
        self.post_json("/sdapi/v1/img2img", req).await
    }

    pub async fn extra_single_image(
        &self,
        req: &ExtraSingleImageRequest,
    ) -> Result<ExtraSingleImageResponse, SdApiError> {
        self.post_json("/sdapi/v1/extra-single-image", req).await
    }

    /// Fetch the "parameters" infotext embedded in a PNG.
    ///
    /// `image` is a `data:image/png;base64,...` URL.
    pub async fn png_info(&self, image: &str) -> Result<String, SdApiError> {
        let body = json!({ "image": image });
        let info: PngInfoResponse = self.post_json("/sdapi/v1/png-info", &body).await?;
        Ok(info.info)
    }

    // -- options ----------------------------------------------------------------------

    pub async fn set_options(&self, options: &serde_json::Value) -> Result<(), SdApiError> {
        let response = self
            .client
            .post(self.url("/sdapi/v1/options"))
            .json(options)
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Switch the loaded checkpoint. Returns once the backend has loaded it.
    pub async fn set_model(&self, title: &str) -> Result<(), SdApiError> {
        self.set_options(&json!({ "sd_model_checkpoint": title })).await
    }

    /// The checkpoint the backend currently has loaded.
    pub async fn current_model(&self) -> Result<Option<String>, SdApiError> {
        let options: serde_json::Value = self.get_json("/sdapi/v1/options").await?;
        Ok(options
            .get("sd_model_checkpoint")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    /// Interrupt whatever the backend is rendering right now.
    pub async fn interrupt(&self) -> Result<(), SdApiError> {
        let response = self
            .client
            .post(self.url("/sdapi/v1/interrupt"))
            .json(&json!({}))
            .send()
            .await?;
        Self::check_status(response).await
    }

    // -- capabilities -------------------------------------------------------------------

    pub async fn samplers(&self) -> Result<Vec<String>, SdApiError> {
        let items: Vec<SamplerItem> = self.get_json("/sdapi/v1/samplers").await?;
        Ok(items.into_iter().map(|s| s.name).collect())
    }

    pub async fn sd_models(&self) -> Result<Vec<ModelInfo>, SdApiError> {
        let items: Vec<SdModelItem> = self.get_json("/sdapi/v1/sd-models").await?;
        Ok(items
            .into_iter()
            .map(|m| ModelInfo {
                title: m.title,
                filename: m.filename,
            })
            .collect())
    }

    pub async fn hypernetworks(&self) -> Result<Vec<String>, SdApiError> {
        let items: Vec<NamedPathItem> = self.get_json("/sdapi/v1/hypernetworks").await?;
        Ok(items.into_iter().map(|h| h.name).collect())
    }

    pub async fn prompt_styles(&self) -> Result<Vec<StyleInfo>, SdApiError> {
        let items: Vec<StyleItem> = self.get_json("/sdapi/v1/prompt-styles").await?;
        Ok(items
            .into_iter()
            .map(|s| StyleInfo {
                name: s.name,
                prompt: s.prompt.unwrap_or_default(),
                negative_prompt: s.negative_prompt.unwrap_or_default(),
            })
            .collect())
    }

    pub async fn sd_vaes(&self) -> Result<Vec<String>, SdApiError> {
        let items: Vec<VaeItem> = self.get_json("/sdapi/v1/sd-vae").await?;
        Ok(items.into_iter().map(|v| v.model_name).collect())
    }

    pub async fn loras(&self) -> Result<Vec<String>, SdApiError> {
        let items: Vec<NamedPathItem> = self.get_json("/sdapi/v1/loras").await?;
        Ok(items.into_iter().map(|l| l.name).collect())
    }

    /// Ask the backend to rescan its LoRA directory.
    pub async fn refresh_loras(&self) -> Result<(), SdApiError> {
        let response = self
            .client
            .post(self.url("/sdapi/v1/refresh-loras"))
            .send()
            .await?;
        Self::check_status(response).await
    }

    pub async fn scripts(&self) -> Result<ScriptsResponse, SdApiError> {
        self.get_json("/sdapi/v1/scripts").await
    }

    pub async fn upscalers(&self) -> Result<Vec<String>, SdApiError> {
        let items: Vec<SamplerItem> = self.get_json("/sdapi/v1/upscalers").await?;
        Ok(items.into_iter().map(|u| u.name).collect())
    }

    pub async fn controlnet_models(&self) -> Result<Vec<String>, SdApiError> {
        let list: ControlNetModelList = self.get_json("/controlnet/model_list").await?;
        Ok(list.model_list)
    }

    pub async fn controlnet_modules(&self) -> Result<Vec<String>, SdApiError> {
        let list: ControlNetModuleList = self.get_json("/controlnet/module_list").await?;
        Ok(list.module_list)
    }

    /// Run every capability query once.
    ///
    /// A failing optional query (hypernetworks, LoRAs, styles, VAEs, the
    /// ControlNet lists) is logged and leaves its list empty; failures of
    /// the sampler, model, script and upscaler queries are returned.
    pub async fn discover_capabilities(&self) -> Result<Capabilities, SdApiError> {
        let mut caps = Capabilities {
            samplers: self.samplers().await?,
            models: self.sd_models().await?,
            ..Default::default()
        };

        if let Err(e) = self.refresh_loras().await {
            tracing::warn!(api_url = %self.api_url, error = %e, "LoRA refresh failed");
        }
        caps.hypernetworks = optional(self.hypernetworks().await, "hypernetworks");
        caps.loras = optional(self.loras().await, "loras");
        caps.styles = optional(self.prompt_styles().await, "prompt styles");
        caps.vaes = optional(self.sd_vaes().await, "VAEs");

        let scripts = self.scripts().await?;
        caps.txt2img_scripts = scripts.txt2img;
        caps.img2img_scripts = scripts.img2img;
        caps.upscalers = self.upscalers().await?;

        if caps.controlnet_extension() {
            caps.controlnet_models = optional(self.controlnet_models().await, "ControlNet models");
            caps.controlnet_preprocessors =
                optional(self.controlnet_modules().await, "ControlNet preprocessors");
        }

        Ok(caps)
    }

    // ---- private helpers ----

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SdApiError> {
        let response = self.client.get(self.url(path)).send().await?;
        Self::parse_response(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SdApiError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::parse_response(response).await
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`SdApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, SdApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SdApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SdApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), SdApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

fn optional<T>(result: Result<Vec<T>, SdApiError>, what: &str) -> Vec<T> {
    result.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Capability query for {what} failed");
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn urls_join_paths() {
        let api = SdApi::new("http://127.0.0.1:7861".into());
        assert_eq!(api.url("/sdapi/v1/samplers"), "http://127.0.0.1:7861/sdapi/v1/samplers");
    }

    #[tokio::test]
    async fn unreachable_backend_is_request_error() {
        // Port 9 (discard) is closed on test machines.
        let api = SdApi::new("http://127.0.0.1:9".into());
        assert_matches!(api.samplers().await, Err(SdApiError::Request(_)));
        assert!(api.probe_ready().await.is_err());
    }
}
