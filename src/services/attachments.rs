use crate::error::{ApiError, ApiResult};
use crate::models::{FileRef, Secret};
use crate::services::chatgpt_client::backend_headers;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use image::ImageReader;
use serde_json::json;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

/// 可以建立检索索引的文档类型
const RETRIEVAL_MIME_TYPES: &[&str] = &[
    "text/rtf",
    "application/javascript",
    "text/x-tex",
    "text/css",
    "text/xml",
    "message/rfc822",
    "text/javascript",
    "application/rtf",
    "text/x-typescript",
    "application/x-powershell",
    "application/x-sql",
    "text/x-shellscript",
    "text/x-c++",
    "text/markdown",
    "text/x-php",
    "text/x-script.python",
    "text/vbscript",
    "text/x-asm",
    "application/vnd.oasis.opendocument.text",
    "text/x-lisp",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/x-rust",
    "text/x-diff",
    "text/x-python",
    "application/vnd.apple.keynote",
    "application/vnd.ms-powerpoint",
    "application/x-yaml",
    "application/msword",
    "application/x-scala",
    "text/plain",
    "text/html",
    "application/json",
    "text/calendar",
    "text/x-csharp",
    "text/x-rst",
    "text/x-java",
    "text/x-makefile",
    "application/pdf",
    "text/x-c",
    "text/x-vcard",
    "application/vnd.apple.pages",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/x-ruby",
    "text/x-sh",
];

pub const RETRIEVAL_ATTEMPTS: u32 = 10;
pub const RETRIEVAL_INTERVAL: Duration = Duration::from_millis(500);

pub fn is_retrieval_mime(mime_type: &str) -> bool {
    RETRIEVAL_MIME_TYPES.contains(&mime_type)
}

/// 附件上传协作者
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    /// 下载远程附件
    async fn fetch(&self, url: &str) -> ApiResult<Vec<u8>>;

    /// 上传并返回 file_id
    async fn upload(
        &self,
        data: Vec<u8>,
        mime_type: &str,
        file_name: &str,
        secret: &Secret,
        device_id: &str,
    ) -> ApiResult<String>;

    /// 查询一次检索索引状态，完成时返回 token 数
    async fn retrieval_tokens(
        &self,
        file_id: &str,
        secret: &Secret,
        device_id: &str,
    ) -> ApiResult<Option<u32>>;
}

#[derive(Debug, Deserialize)]
struct CreateFileResponse {
    #[serde(default)]
    file_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct RetrievalStatus {
    #[serde(default)]
    file_size_tokens: u32,
    #[serde(default)]
    retrieval_index_status: String,
}

/// 后端 files 接口的三步上传
pub struct BackendUploader {
    client: Client,
    base_url: String,
    fallback_puid: Option<String>,
}

impl BackendUploader {
    pub fn new(client: Client, base_url: String, fallback_puid: Option<String>) -> Self {
        Self {
            client,
            base_url,
            fallback_puid,
        }
    }

    fn files_url(&self) -> String {
        format!("{}/backend-api/files", self.base_url)
    }
}

#[async_trait]
impl AttachmentUploader for BackendUploader {
    async fn fetch(&self, url: &str) -> ApiResult<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::UpstreamRaw {
                status: response.status().as_u16(),
                body: format!("failed to download {}", url),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn upload(
        &self,
        data: Vec<u8>,
        mime_type: &str,
        file_name: &str,
        secret: &Secret,
        device_id: &str,
    ) -> ApiResult<String> {
        let use_case = if mime_type.starts_with("image") {
            "multimodal"
        } else if is_retrieval_mime(mime_type) {
            "my_files"
        } else {
            "ace_upload"
        };
        let headers = backend_headers(secret, device_id, self.fallback_puid.as_deref());

        // 1. 申请上传地址
        let created: CreateFileResponse = self
            .client
            .post(self.files_url())
            .headers(headers.clone())
            .json(&json!({
                "file_name": file_name,
                "file_size": data.len(),
                "use_case": use_case,
            }))
            .send()
            .await?
            .json()
            .await?;
        if created.status != "success" {
            return Err(ApiError::Internal(format!(
                "file creation rejected: {}",
                created.status
            )));
        }

        // 2. 上传二进制
        let response = self
            .client
            .put(&created.upload_url)
            .header("X-Ms-Blob-Type", "BlockBlob")
            .header("X-Ms-Version", "2020-04-08")
            .body(data)
            .send()
            .await?;
        if response.status().as_u16() != 201 {
            return Err(ApiError::UpstreamRaw {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        // 3. 确认上传完成
        self.client
            .post(format!("{}/{}/uploaded", self.files_url(), created.file_id))
            .headers(headers)
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?;

        debug!("附件上传完成: {} ({})", created.file_id, file_name);
        Ok(created.file_id)
    }

    async fn retrieval_tokens(
        &self,
        file_id: &str,
        secret: &Secret,
        device_id: &str,
    ) -> ApiResult<Option<u32>> {
        let status: RetrievalStatus = self
            .client
            .get(format!("{}/{}", self.files_url(), file_id))
            .headers(backend_headers(secret, device_id, self.fallback_puid.as_deref()))
            .send()
            .await?
            .json()
            .await?;

        if status.retrieval_index_status == "success" {
            Ok(Some(status.file_size_tokens))
        } else {
            Ok(None)
        }
    }
}

/// 轮询检索索引，超过次数返回0
pub async fn poll_retrieval_tokens(
    uploader: &dyn AttachmentUploader,
    file_id: &str,
    secret: &Secret,
    device_id: &str,
    attempts: u32,
    interval: Duration,
) -> u32 {
    for attempt in 1..=attempts {
        match uploader.retrieval_tokens(file_id, secret, device_id).await {
            Ok(Some(tokens)) => return tokens,
            Ok(None) => {}
            Err(e) => {
                debug!("检索状态查询失败: {}", e);
                return 0;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    0
}

/// 将 image_url 解析为已上传文件，失败时返回 None
pub async fn resolve_attachment(
    uploader: &dyn AttachmentUploader,
    url: &str,
    secret: &Secret,
    device_id: &str,
) -> Option<FileRef> {
    let (data, mime_type, file_name) = if url.starts_with("data:") {
        decode_data_url(url)?
    } else {
        let file_name = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime_from_name(&file_name);
        match uploader.fetch(url).await {
            Ok(data) => (data, mime_type, file_name),
            Err(e) => {
                warn!("下载附件失败 {}: {}", url, e);
                return None;
            }
        }
    };

    let is_image = mime_type
        .parse::<mime::Mime>()
        .map(|m| m.type_() == mime::IMAGE)
        .unwrap_or(false);
    let (width, height) = if is_image {
        image_dimensions(&data).unwrap_or((0, 0))
    } else {
        (0, 0)
    };
    let size = data.len();

    let file_id = match uploader
        .upload(data, &mime_type, &file_name, secret, device_id)
        .await
    {
        Ok(file_id) => file_id,
        Err(e) => {
            warn!("上传附件失败: {}", e);
            return None;
        }
    };

    let token_size = if !is_image && is_retrieval_mime(&mime_type) {
        poll_retrieval_tokens(
            uploader,
            &file_id,
            secret,
            device_id,
            RETRIEVAL_ATTEMPTS,
            RETRIEVAL_INTERVAL,
        )
        .await
    } else {
        0
    };

    Some(FileRef {
        file_id,
        mime_type,
        file_name,
        size,
        is_image,
        width,
        height,
        token_size,
    })
}

/// data:<mime>;base64,<payload>
fn decode_data_url(url: &str) -> Option<(Vec<u8>, String, String)> {
    let (header, payload) = url.strip_prefix("data:")?.split_once(',')?;
    let mime_type = header.split(';').next().unwrap_or_default().to_string();
    let data = general_purpose::STANDARD.decode(payload.trim()).ok()?;

    let extension = match mime_type.split('/').nth(1).unwrap_or("bin") {
        "jpeg" => "jpg",
        "plain" => "txt",
        "markdown" => "md",
        other => other,
    };
    let file_name = format!("file.{}", extension);
    Some((data, mime_type, file_name))
}

fn mime_from_name(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .to_string()
}

/// 读取图片宽高，无法识别时返回 None
fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// 记录调用的上传假实现
    pub(crate) struct FakeUploader {
        pub uploads: Mutex<Vec<(String, String)>>,
        pub retrieval_results: Mutex<Vec<Option<u32>>>,
    }

    impl FakeUploader {
        pub(crate) fn new() -> Self {
            Self {
                uploads: Mutex::new(Vec::new()),
                retrieval_results: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AttachmentUploader for FakeUploader {
        async fn fetch(&self, _url: &str) -> ApiResult<Vec<u8>> {
            Ok(b"remote file body".to_vec())
        }

        async fn upload(
            &self,
            _data: Vec<u8>,
            mime_type: &str,
            file_name: &str,
            _secret: &Secret,
            _device_id: &str,
        ) -> ApiResult<String> {
            let mut uploads = self.uploads.lock();
            uploads.push((mime_type.to_string(), file_name.to_string()));
            Ok(format!("file-{}", uploads.len()))
        }

        async fn retrieval_tokens(
            &self,
            _file_id: &str,
            _secret: &Secret,
            _device_id: &str,
        ) -> ApiResult<Option<u32>> {
            let mut results = self.retrieval_results.lock();
            if results.is_empty() {
                Ok(None)
            } else {
                Ok(results.remove(0))
            }
        }
    }

    /// 指定尺寸的真实 PNG
    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::new();
        image::DynamicImage::new_rgb8(width, height)
            .write_to(&mut Cursor::new(&mut data), image::ImageFormat::Png)
            .unwrap();
        data
    }

    fn gif_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::new();
        image::DynamicImage::new_rgba8(width, height)
            .write_to(&mut Cursor::new(&mut data), image::ImageFormat::Gif)
            .unwrap();
        data
    }

    #[test]
    fn test_image_dimensions() {
        assert_eq!(image_dimensions(&png_bytes(640, 480)), Some((640, 480)));
        assert_eq!(image_dimensions(&gif_bytes(32, 16)), Some((32, 16)));
        assert_eq!(image_dimensions(b"plain text"), None);
    }

    #[test]
    fn test_decode_data_url() {
        let url = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(png_bytes(2, 3))
        );
        let (data, mime_type, name) = decode_data_url(&url).unwrap();
        assert_eq!(mime_type, "image/png");
        assert_eq!(name, "file.png");
        assert_eq!(image_dimensions(&data), Some((2, 3)));

        let (_, mime_type, name) = decode_data_url("data:image/jpeg;base64,AAAA").unwrap();
        assert_eq!(mime_type, "image/jpeg");
        assert_eq!(name, "file.jpg");
    }

    #[test]
    fn test_mime_from_name() {
        assert_eq!(mime_from_name("photo.JPG"), "image/jpeg");
        assert_eq!(mime_from_name("report.pdf"), "application/pdf");
        assert_eq!(mime_from_name("archive"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_resolve_data_url_image() {
        let uploader = FakeUploader::new();
        let url = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(png_bytes(10, 20))
        );

        let file = resolve_attachment(&uploader, &url, &Secret::default(), "device")
            .await
            .unwrap();
        assert!(file.is_image);
        assert_eq!((file.width, file.height), (10, 20));
        assert_eq!(file.file_id, "file-1");
        assert_eq!(file.token_size, 0);
    }

    #[tokio::test]
    async fn test_resolve_remote_document_polls_retrieval() {
        let uploader = FakeUploader::new();
        *uploader.retrieval_results.lock() = vec![None, None, Some(42)];

        let file = resolve_attachment(
            &uploader,
            "https://example.com/docs/readme.md?x=1",
            &Secret::default(),
            "device",
        )
        .await
        .unwrap();
        assert!(!file.is_image);
        assert_eq!(file.file_name, "readme.md");
        assert_eq!(file.mime_type, "text/markdown");
        assert_eq!(file.token_size, 42);
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_attempts() {
        let uploader = FakeUploader::new();
        let tokens = poll_retrieval_tokens(
            &uploader,
            "file-1",
            &Secret::default(),
            "device",
            3,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(tokens, 0);
    }
}
