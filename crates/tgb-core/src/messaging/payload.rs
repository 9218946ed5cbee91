//! Sendable payloads and their encoding into Bot API requests.

use std::{fmt, path::PathBuf, sync::Arc};

use serde_json::{json, Map, Value};

use crate::{
    domain::ChatRef,
    errors::Error,
    messaging::{
        port::{Body, FileData, FilePart, Request},
        types::SendOptions,
    },
    Result,
};

pub const MAX_MESSAGE_SIZE: usize = 4096;
pub const MAX_CAPTION_SIZE: usize = 1024;
pub const MAX_MEDIA_GROUP_SIZE: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParseMode {
    Html,
    MarkdownV2,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
            ParseMode::MarkdownV2 => "MarkdownV2",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaType {
    Photo,
    Animation,
    Video,
    Document,
    Audio,
    Sticker,
    Voice,
}

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;

impl MediaType {
    /// Field name, also used as the `type` in media group items.
    pub fn name(self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Animation => "animation",
            MediaType::Video => "video",
            MediaType::Document => "document",
            MediaType::Audio => "audio",
            MediaType::Sticker => "sticker",
            MediaType::Voice => "voice",
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            MediaType::Photo => "sendPhoto",
            MediaType::Animation => "sendAnimation",
            MediaType::Video => "sendVideo",
            MediaType::Document => "sendDocument",
            MediaType::Audio => "sendAudio",
            MediaType::Sticker => "sendSticker",
            MediaType::Voice => "sendVoice",
        }
    }

    /// Largest file the server will fetch itself when given a URL.
    pub fn remote_max(self) -> u64 {
        match self {
            MediaType::Photo => 5 * MB,
            MediaType::Sticker => 512 * KB,
            MediaType::Voice => MB,
            _ => 20 * MB,
        }
    }

    /// Largest file accepted as a multipart upload.
    pub fn attach_max(self) -> u64 {
        match self {
            MediaType::Photo => 10 * MB,
            MediaType::Sticker => 512 * KB,
            _ => 50 * MB,
        }
    }

    /// Best media type for a MIME type, as Telegram renders it.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim().to_ascii_lowercase();
        match mime.as_str() {
            "image/gif" => MediaType::Animation,
            "image/webp" => MediaType::Sticker,
            "audio/ogg" => MediaType::Voice,
            m if m.starts_with("image/") => MediaType::Photo,
            "video/webm" => MediaType::Document,
            m if m.starts_with("video/") => MediaType::Video,
            m if m.starts_with("audio/") => MediaType::Audio,
            _ => MediaType::Document,
        }
    }

    fn groupable(self) -> bool {
        matches!(
            self,
            MediaType::Photo | MediaType::Video | MediaType::Document | MediaType::Audio
        )
    }
}

/// Where media bytes come from.
#[derive(Clone, PartialEq)]
pub enum InputSource {
    /// The server downloads the file itself.
    Url(String),
    /// A file already stored on the server.
    FileId(String),
    Bytes { file_name: String, data: Arc<[u8]> },
    /// Local file, re-opened on every attempt.
    Path(PathBuf),
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Url(u) => f.debug_tuple("Url").field(u).finish(),
            InputSource::FileId(id) => f.debug_tuple("FileId").field(id).finish(),
            InputSource::Bytes { file_name, data } => f
                .debug_struct("Bytes")
                .field("file_name", file_name)
                .field("len", &data.len())
                .finish(),
            InputSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
        }
    }
}

impl InputSource {
    pub fn bytes(file_name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        InputSource::Bytes {
            file_name: file_name.into(),
            data: data.into(),
        }
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, InputSource::Bytes { .. } | InputSource::Path(_))
    }

    /// Size in bytes when it is known without I/O.
    pub fn known_size(&self) -> Option<u64> {
        match self {
            InputSource::Bytes { data, .. } => Some(data.len() as u64),
            _ => None,
        }
    }

    /// Form value for this input; uploads are registered in `files` and referenced
    /// as `attach://{attach_name}`.
    fn encode(
        &self,
        attach_name: &str,
        mime_type: Option<&str>,
        files: &mut Vec<(String, FilePart)>,
    ) -> String {
        let (file_name, data) = match self {
            InputSource::Url(u) => return u.clone(),
            InputSource::FileId(id) => return id.clone(),
            InputSource::Bytes { file_name, data } => {
                (file_name.clone(), FileData::Bytes(data.clone()))
            }
            InputSource::Path(p) => (
                p.file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("file")
                    .to_string(),
                FileData::Path(p.clone()),
            ),
        };
        files.push((
            attach_name.to_string(),
            FilePart {
                file_name,
                mime_type: mime_type.map(str::to_string),
                data,
            },
        ));
        format!("attach://{attach_name}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Media {
    pub kind: MediaType,
    pub source: InputSource,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    pub parse_mode: Option<ParseMode>,
}

impl Media {
    pub fn new(kind: MediaType, source: InputSource) -> Self {
        Self {
            kind,
            source,
            mime_type: None,
            caption: None,
            parse_mode: None,
        }
    }

    pub fn caption(mut self, caption: impl Into<String>, parse_mode: Option<ParseMode>) -> Self {
        self.caption = Some(caption.into());
        self.parse_mode = parse_mode;
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(caption) = &self.caption {
            let len = caption.chars().count();
            if len > MAX_CAPTION_SIZE {
                return Err(Error::Encoding(format!(
                    "caption is {len} characters, limit is {MAX_CAPTION_SIZE}"
                )));
            }
        }
        if let Some(size) = self.source.known_size() {
            if size > self.kind.attach_max() {
                return Err(Error::Encoding(format!(
                    "{} of {size} bytes exceeds the {} byte upload limit",
                    self.kind.name(),
                    self.kind.attach_max()
                )));
            }
        }
        Ok(())
    }

    fn put_caption(&self, params: &mut Map<String, Value>) {
        if let Some(caption) = &self.caption {
            params.insert("caption".into(), json!(caption));
            if let Some(mode) = self.parse_mode {
                params.insert("parse_mode".into(), json!(mode.as_str()));
            }
        }
    }
}

/// Everything the scheduler knows how to send.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text {
        text: String,
        parse_mode: Option<ParseMode>,
        disable_web_page_preview: bool,
    },
    Media(Media),
    MediaGroup(Vec<Media>),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text {
            text: text.into(),
            parse_mode: None,
            disable_web_page_preview: false,
        }
    }

    pub fn html(text: impl Into<String>) -> Self {
        Payload::Text {
            text: text.into(),
            parse_mode: Some(ParseMode::Html),
            disable_web_page_preview: true,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Payload::Text { .. } => "sendMessage",
            Payload::Media(m) => m.kind.method(),
            Payload::MediaGroup(_) => "sendMediaGroup",
        }
    }

    /// Encode into a request addressed to `chat`.
    pub fn encode(&self, chat: &ChatRef, opts: &SendOptions) -> Result<Request> {
        let mut params = Map::new();
        params.insert("chat_id".into(), serde_json::to_value(chat)?);
        if opts.disable_notification {
            params.insert("disable_notification".into(), json!(true));
        }
        if let Some(id) = opts.reply_to_message_id {
            params.insert("reply_to_message_id".into(), json!(id));
        }

        let mut files = Vec::new();
        match self {
            Payload::Text {
                text,
                parse_mode,
                disable_web_page_preview,
            } => {
                let len = text.chars().count();
                if text.trim().is_empty() {
                    return Err(Error::Encoding("message text is empty".to_string()));
                }
                if len > MAX_MESSAGE_SIZE {
                    return Err(Error::Encoding(format!(
                        "message is {len} characters, limit is {MAX_MESSAGE_SIZE}"
                    )));
                }
                params.insert("text".into(), json!(text));
                if let Some(mode) = parse_mode {
                    params.insert("parse_mode".into(), json!(mode.as_str()));
                }
                if *disable_web_page_preview {
                    params.insert("disable_web_page_preview".into(), json!(true));
                }
            }
            Payload::Media(media) => {
                media.validate()?;
                let field = media.kind.name();
                let value = media
                    .source
                    .encode(field, media.mime_type.as_deref(), &mut files);
                params.insert(field.into(), json!(value));
                media.put_caption(&mut params);
            }
            Payload::MediaGroup(items) => {
                if items.is_empty() || items.len() > MAX_MEDIA_GROUP_SIZE {
                    return Err(Error::Encoding(format!(
                        "media group must have 1..={MAX_MEDIA_GROUP_SIZE} items, got {}",
                        items.len()
                    )));
                }
                let mut group = Vec::with_capacity(items.len());
                for (i, media) in items.iter().enumerate() {
                    media.validate()?;
                    if !media.kind.groupable() {
                        return Err(Error::Encoding(format!(
                            "{} cannot be sent in a media group",
                            media.kind.name()
                        )));
                    }
                    let mut item = Map::new();
                    item.insert("type".into(), json!(media.kind.name()));
                    let value =
                        media
                            .source
                            .encode(&format!("file{i}"), media.mime_type.as_deref(), &mut files);
                    item.insert("media".into(), json!(value));
                    media.put_caption(&mut item);
                    group.push(Value::Object(item));
                }
                params.insert("media".into(), Value::Array(group));
            }
        }

        if let Some(markup) = &opts.reply_markup {
            if matches!(self, Payload::MediaGroup(_)) {
                return Err(Error::Encoding(
                    "media groups do not accept reply markup".to_string(),
                ));
            }
            params.insert("reply_markup".into(), serde_json::to_value(markup)?);
        }

        Ok(Request {
            method: self.method(),
            body: Body::new(Value::Object(params), files)?,
        })
    }
}
