//! Extraction of the raw source files from the artifact store.
//!
//! Each [`SourceFile`] in the manifest is fetched (all of its parts, in
//! order), decoded, line-ending normalized, reassembled into a single file
//! with one header, and written to the data dir. Either every file lands or
//! none does: output is staged to hidden temp files and only renamed into
//! place after the whole manifest succeeded.

pub mod normalize;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use starload_shared::{Result, SourceFile, SourceManifest, StarloadError};

/// Maximum number of redirects to follow (release assets redirect to a CDN).
const MAX_REDIRECTS: usize = 5;

/// User-Agent string for artifact requests.
const USER_AGENT: &str = concat!("starload/", env!("CARGO_PKG_VERSION"));

/// Name of the extraction summary written next to the extracted files.
pub const REPORT_FILE_NAME: &str = "extract.json";

// ---------------------------------------------------------------------------
// Options and report
// ---------------------------------------------------------------------------

/// Configuration for an extraction run.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Artifact store root (`http(s)://` or `file://`), ending in `/`.
    pub base_url: Url,
    /// Directory the complete files are written to.
    pub data_dir: PathBuf,
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
}

/// Summary of one extracted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFile {
    /// File name inside the data dir.
    pub name: String,
    /// Number of remote parts it was assembled from.
    pub parts: usize,
    /// Data rows, header excluded.
    pub data_rows: u64,
    /// Size after normalization.
    pub bytes: u64,
    /// Hex SHA-256 of the normalized content.
    pub sha256: String,
}

/// Outcome of a successful extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractReport {
    pub data_dir: PathBuf,
    pub files: Vec<ExtractedFile>,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractReport {
    pub fn total_rows(&self) -> u64 {
        self.files.iter().map(|f| f.data_rows).sum()
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Fetch, normalize, and reassemble every file in `manifest` into `opts.data_dir`.
#[instrument(skip_all, fields(base_url = %opts.base_url, files = manifest.files.len()))]
pub async fn extract(manifest: &SourceManifest, opts: &ExtractOptions) -> Result<ExtractReport> {
    manifest.check()?;

    std::fs::create_dir_all(&opts.data_dir)
        .map_err(|e| StarloadError::io(&opts.data_dir, e))?;

    let fetcher = Fetcher::new(opts)?;
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(manifest.files.len());
    let mut files = Vec::with_capacity(manifest.files.len());

    for source in &manifest.files {
        match extract_file(&fetcher, source, &opts.data_dir).await {
            Ok((temp, extracted)) => {
                staged.push((temp, opts.data_dir.join(&source.name)));
                files.push(extracted);
            }
            Err(e) => {
                discard(&staged);
                return Err(e);
            }
        }
    }

    for (temp, target) in &staged {
        if let Err(e) = std::fs::rename(temp, target) {
            discard(&staged);
            return Err(StarloadError::io(target, e));
        }
    }

    let report = ExtractReport {
        data_dir: opts.data_dir.clone(),
        files,
        extracted_at: Utc::now(),
    };
    write_report(&opts.data_dir, &report)?;

    info!(
        files = report.files.len(),
        rows = report.total_rows(),
        "extraction complete"
    );

    Ok(report)
}

/// Fetch every part of one file, normalize, reassemble, and stage it to a temp file.
async fn extract_file(
    fetcher: &Fetcher,
    source: &SourceFile,
    data_dir: &Path,
) -> Result<(PathBuf, ExtractedFile)> {
    let mut parts = Vec::with_capacity(source.parts.len());
    for part in &source.parts {
        let bytes = fetcher.fetch(part).await?;
        debug!(part = %part, bytes = bytes.len(), "fetched object");
        let decoded = normalize::decode(&bytes);
        if let Some(offset) = decoded.fallback_at {
            warn!(
                file = %source.name,
                part = %part,
                offset,
                "invalid UTF-8; decoded whole object as Windows-1252"
            );
        }
        parts.push(normalize::normalize_line_endings(&decoded.text));
    }

    let content = if source.is_split() {
        normalize::reassemble(&source.name, &parts)?
    } else {
        parts.pop().unwrap_or_default()
    };

    if content.is_empty() {
        return Err(StarloadError::extraction(format!("{}: file is empty", source.name)));
    }

    let data_rows = normalize::count_data_rows(&source.name, &content)?;
    let sha256 = {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    };

    let temp = data_dir.join(format!(".{}.part", source.name));
    std::fs::write(&temp, &content).map_err(|e| StarloadError::io(&temp, e))?;

    info!(
        file = %source.name,
        parts = source.parts.len(),
        rows = data_rows,
        "file extracted"
    );

    Ok((
        temp,
        ExtractedFile {
            name: source.name.clone(),
            parts: source.parts.len(),
            data_rows,
            bytes: content.len() as u64,
            sha256,
        },
    ))
}

/// Remove staged temp files after a failure.
fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (temp, _) in staged {
        if let Err(e) = std::fs::remove_file(temp) {
            warn!(path = %temp.display(), error = %e, "failed to remove staged file");
        }
    }
}

/// Write `extract.json` atomically (write to temp, then rename).
fn write_report(data_dir: &Path, report: &ExtractReport) -> Result<()> {
    let target = data_dir.join(REPORT_FILE_NAME);
    let temp = data_dir.join(format!(".{REPORT_FILE_NAME}.tmp"));
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| StarloadError::extraction(format!("failed to serialize report: {e}")))?;
    std::fs::write(&temp, json).map_err(|e| StarloadError::io(&temp, e))?;
    std::fs::rename(&temp, &target).map_err(|e| StarloadError::io(&target, e))
}

/// Read a previously written `extract.json`, if any.
pub fn read_report(data_dir: &Path) -> Result<Option<ExtractReport>> {
    let path = data_dir.join(REPORT_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| StarloadError::io(&path, e))?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StarloadError::validation(format!("invalid {REPORT_FILE_NAME}: {e}")))
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Retrieves raw objects from the artifact store.
enum Fetcher {
    Http { client: Client, base: Url },
    Local { dir: PathBuf },
}

impl Fetcher {
    fn new(opts: &ExtractOptions) -> Result<Self> {
        match opts.base_url.scheme() {
            "file" => {
                let dir = opts.base_url.to_file_path().map_err(|_| {
                    StarloadError::config(format!("invalid file URL: {}", opts.base_url))
                })?;
                Ok(Self::Local { dir })
            }
            _ => Ok(Self::Http {
                client: build_client(opts)?,
                base: opts.base_url.clone(),
            }),
        }
    }

    async fn fetch(&self, object: &str) -> Result<Vec<u8>> {
        match self {
            Self::Http { client, base } => {
                let url = base.join(object).map_err(|e| {
                    StarloadError::extraction(format!("invalid object name '{object}': {e}"))
                })?;
                fetch_http(client, &url, object).await
            }
            Self::Local { dir } => {
                let path = dir.join(object);
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                        StarloadError::extraction(format!("missing source object '{object}'")),
                    ),
                    Err(e) => Err(StarloadError::io(path, e)),
                }
            }
        }
    }
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &ExtractOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(std::time::Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| StarloadError::Network(format!("failed to build HTTP client: {e}")))
}

async fn fetch_http(client: &Client, url: &Url, object: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| StarloadError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(StarloadError::extraction(format!(
            "missing source object '{object}' ({url})"
        )));
    }
    if !status.is_success() {
        return Err(StarloadError::Network(format!("{url}: HTTP {status}")));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| StarloadError::Network(format!("{url}: failed to read body: {e}")))?;

    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("starload_extract_{}", uuid::Uuid::now_v7()))
    }

    fn small_manifest() -> SourceManifest {
        SourceManifest {
            files: vec![
                SourceFile::single("olist_sellers_dataset.csv", "stg_sellers"),
                SourceFile::split("olist_geolocation_dataset.csv", "stg_geolocation", 3),
            ],
        }
    }

    async fn mount(server: &MockServer, object: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/release/{object}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn extract_from_mock_server() {
        let server = MockServer::start().await;
        mount(
            &server,
            "olist_sellers_dataset.csv",
            "seller_id,seller_zip_code_prefix,seller_city,seller_state\r\ns1,13023,campinas,SP\r\n",
        )
        .await;
        let header = "geolocation_zip_code_prefix,geolocation_lat,geolocation_lng,geolocation_city,geolocation_state\r\n";
        mount(
            &server,
            "olist_geolocation_dataset_part_01.csv",
            &format!("{header}01037,-23.54,-46.63,sao paulo,SP\r\n"),
        )
        .await;
        mount(
            &server,
            "olist_geolocation_dataset_part_02.csv",
            &format!("{header}01046,-23.54,-46.64,sao paulo,SP\r\n01046,-23.55,-46.64,sao paulo,SP\r\n"),
        )
        .await;
        mount(
            &server,
            "olist_geolocation_dataset_part_03.csv",
            &format!("{header}13023,-22.89,-47.06,campinas,SP\r\n"),
        )
        .await;

        let data_dir = temp_dir();
        let opts = ExtractOptions {
            base_url: Url::parse(&format!("{}/release/", server.uri())).unwrap(),
            data_dir: data_dir.clone(),
            timeout_secs: 5,
        };

        let report = extract(&small_manifest(), &opts).await.expect("extract");
        assert_eq!(report.files.len(), 2);
        let geo = &report.files[1];
        assert_eq!(geo.parts, 3);
        assert_eq!(geo.data_rows, 4);

        let merged = std::fs::read_to_string(data_dir.join("olist_geolocation_dataset.csv")).unwrap();
        assert!(!merged.contains('\r'));
        assert_eq!(merged.lines().count(), 5);
        assert_eq!(merged.matches("geolocation_zip_code_prefix").count(), 1);

        let saved = read_report(&data_dir).unwrap().expect("report written");
        assert_eq!(saved.files, report.files);
    }

    #[tokio::test]
    async fn missing_part_aborts_without_output() {
        let server = MockServer::start().await;
        mount(&server, "olist_sellers_dataset.csv", "seller_id\ns1\n").await;
        mount(&server, "olist_geolocation_dataset_part_01.csv", "zip\n1\n").await;
        // part 02 is never mounted → 404
        mount(&server, "olist_geolocation_dataset_part_03.csv", "zip\n3\n").await;

        let data_dir = temp_dir();
        let opts = ExtractOptions {
            base_url: Url::parse(&format!("{}/release/", server.uri())).unwrap(),
            data_dir: data_dir.clone(),
            timeout_secs: 5,
        };

        let err = extract(&small_manifest(), &opts).await.unwrap_err();
        assert!(err.to_string().contains("olist_geolocation_dataset_part_02.csv"));
        assert!(!data_dir.join("olist_sellers_dataset.csv").exists());
        assert!(!data_dir.join(".olist_sellers_dataset.csv.part").exists());
        assert!(read_report(&data_dir).unwrap().is_none());
    }

    #[tokio::test]
    async fn out_of_sequence_manifest_rejected_before_fetch() {
        let mut manifest = small_manifest();
        manifest.files[1].parts.swap(0, 2);

        let opts = ExtractOptions {
            base_url: Url::parse("http://127.0.0.1:9/").unwrap(),
            data_dir: temp_dir(),
            timeout_secs: 1,
        };
        let err = extract(&manifest, &opts).await.unwrap_err();
        assert!(matches!(err, StarloadError::Extraction { .. }));
    }

    #[tokio::test]
    async fn extract_from_local_directory() {
        let mirror = temp_dir();
        std::fs::create_dir_all(&mirror).unwrap();
        std::fs::write(mirror.join("olist_sellers_dataset.csv"), "seller_id\r\ns1\r\ns2").unwrap();
        for n in 1..=3 {
            std::fs::write(
                mirror.join(format!("olist_geolocation_dataset_part_{n:02}.csv")),
                format!("zip\n{n}\n"),
            )
            .unwrap();
        }

        let data_dir = temp_dir();
        let opts = ExtractOptions {
            base_url: Url::from_directory_path(&mirror).unwrap(),
            data_dir: data_dir.clone(),
            timeout_secs: 1,
        };
        let report = extract(&small_manifest(), &opts).await.expect("extract");
        assert_eq!(report.files[0].data_rows, 2);
        assert_eq!(report.files[1].data_rows, 3);
        assert_eq!(
            std::fs::read_to_string(data_dir.join("olist_sellers_dataset.csv")).unwrap(),
            "seller_id\ns1\ns2\n"
        );
    }
}
