use std::path::Path;
use std::time::Duration;

use apkup_backend::{
    DownloadError, DownloadResponse, FetchError, HttpRequest, HttpResponse, HttpTransport,
};
use async_trait::async_trait;
use log::{debug, trace};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Production transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the given timeouts.
    ///
    /// # Errors
    /// Returns an error when the TLS backend cannot be initialised.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(format!("apkup/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(&request.url);
        if let Some(token) = &request.bearer {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(accept) = request.accept {
            builder = builder.header(reqwest::header::ACCEPT, accept);
        }
        builder
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        debug!("GET {}", request.url);

        let response = self
            .build(request)
            .send()
            .await
            .map_err(|error| FetchError::network_request_from("http get", error))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|error| FetchError::network_request_from("http body", error))?;

        trace!("GET {} -> {status} ({} bytes)", request.url, body.len());
        Ok(HttpResponse {
            status,
            final_url,
            body: body.to_vec(),
        })
    }

    async fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
    ) -> Result<DownloadResponse, DownloadError> {
        use futures_util::StreamExt;

        let file_name = dest
            .file_name()
            .map_or_else(|| request.url.clone(), |n| n.to_string_lossy().into_owned());

        let response = self
            .build(request)
            .send()
            .await
            .map_err(|error| DownloadError::transfer(&file_name, error))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Ok(DownloadResponse {
                status,
                bytes_written: 0,
            });
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|error| DownloadError::io(dest, &error))?;

        let mut bytes_written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| DownloadError::transfer(&file_name, error))?;
            file.write_all(&chunk)
                .await
                .map_err(|error| DownloadError::io(dest, &error))?;
            bytes_written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|error| DownloadError::io(dest, &error))?;
        file.sync_all()
            .await
            .map_err(|error| DownloadError::io(dest, &error))?;

        debug!("Downloaded {} ({bytes_written} bytes)", request.url);
        Ok(DownloadResponse {
            status,
            bytes_written,
        })
    }
}
