// src/utils.rs

use crate::{constants, error::*, models::Track};
use std::sync::LazyLock;
use regex::Regex;
use std::{ffi::OsStr, path::Path};
use url::Url;
use uuid::Uuid;

static ILLEGAL_CHARS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|]"#).unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static AUDIO_EXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{1,5}$").unwrap());

pub fn sanitize_filename(name: &str) -> String {
    let original_name = name.trim();
    if original_name.is_empty() { return "unknown".to_string(); }

    let stem = Path::new(original_name)
        .file_stem()
        .unwrap_or_else(|| OsStr::new(original_name))
        .to_string_lossy()
        .to_uppercase();
    let windows_reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    let mut name = if windows_reserved.contains(&stem.as_ref()) {
        format!("_{}", original_name)
    } else {
        original_name.to_string()
    };

    name = ILLEGAL_CHARS_RE.replace_all(&name, " ").into_owned();
    name = WHITESPACE_RE.replace_all(&name, " ").trim().to_string();
    name = name.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string();
    if name.is_empty() { return "unnamed".to_string(); }

    if name.len() > constants::MAX_FILENAME_BYTES {
        if let (Some(stem_part), Some(ext)) = (Path::new(&name).file_stem(), Path::new(&name).extension()) {
            let stem_part_str = stem_part.to_string_lossy();
            let ext_str = format!(".{}", ext.to_string_lossy());
            let max_stem_bytes = constants::MAX_FILENAME_BYTES.saturating_sub(ext_str.len());
            let truncated_stem = safe_truncate_utf8(&stem_part_str, max_stem_bytes);
            name = format!("{}{}", truncated_stem, ext_str);
        } else {
            name = safe_truncate_utf8(&name, constants::MAX_FILENAME_BYTES).to_string();
        }
    }
    name
}

fn safe_truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes { return s; }
    let mut i = max_bytes;
    while i > 0 && !s.is_char_boundary(i) { i -= 1; }
    &s[..i]
}

pub fn truncate_text(text: &str, max_width: usize) -> String {
    let mut width = 0;
    let mut end_pos = 0;
    for (i, c) in text.char_indices() {
        width += if c.is_ascii() { 1 } else { 2 };
        if width > max_width.saturating_sub(3) {
            end_pos = i;
            break;
        }
    }
    if end_pos == 0 { text.to_string() } else { format!("{}...", &text[..end_pos]) }
}

/// 进程内唯一的批次 ID: 毫秒时间戳 + 随机后缀
pub fn generate_batch_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("batch_{}_{}", chrono::Utc::now().timestamp_millis(), &suffix[..9])
}

/// 从源地址的路径部分推断音频扩展名，无法识别时返回默认值
pub fn extension_from_url(source_url: &str) -> String {
    let path = match Url::parse(source_url) {
        Ok(url) => url.path().to_string(),
        Err(_) => source_url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    Path::new(&path)
        .extension()
        .and_then(|s| s.to_str())
        .filter(|ext| AUDIO_EXT_RE.is_match(ext))
        .map(|ext| ext.to_lowercase())
        .unwrap_or_else(|| constants::DEFAULT_AUDIO_EXT.to_string())
}

/// 保存到本地时建议使用的文件名: `艺人 - 曲名.扩展名`
pub fn suggested_filename(track: &Track) -> String {
    let artist = track.artist.trim();
    let title = track.display_name.trim();
    let base = match (artist.is_empty(), title.is_empty()) {
        (false, false) => format!("{} - {}", artist, title),
        (true, false) => title.to_string(),
        (false, true) => format!("{} - {}", artist, track.id),
        (true, true) => format!("track-{}", track.id),
    };
    sanitize_filename(&format!("{}.{}", base, extension_from_url(&track.source_url)))
}

/// 解析批量文件: 先尝试 JSON 数组，否则按 `id<TAB>曲名<TAB>艺人<TAB>地址` 逐行解析
pub fn parse_track_list(content: &str) -> AppResult<Vec<Track>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    let mut tracks = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let id = fields[0].parse::<u64>().map_err(|_| {
            AppError::UserInputError(format!(
                "第 {} 行的曲目 ID '{}' 不是有效的数字",
                line_no + 1,
                fields[0]
            ))
        })?;
        tracks.push(Track {
            id,
            display_name: fields.get(1).copied().unwrap_or_default().to_string(),
            artist: fields.get(2).copied().unwrap_or_default().to_string(),
            source_url: fields.get(3).copied().unwrap_or_default().to_string(),
        });
    }
    Ok(tracks)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn track(artist: &str, title: &str, url: &str) -> Track {
        Track {
            id: 7,
            display_name: title.to_string(),
            artist: artist.to_string(),
            source_url: url.to_string(),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        // 测试非法字符
        assert_eq!(sanitize_filename("a\\b/c:d*e?f\"g<h>i|j"), "a b c d e f g h i j".to_string());

        // 测试首尾空格和点
        assert_eq!(sanitize_filename(" . my file. "), "my file".to_string());

        // 测试 Windows 保留字 (大小写不敏感)
        assert_eq!(sanitize_filename("CON.txt"), "_CON.txt".to_string());

        // 测试空或只有非法字符的输入
        assert_eq!(sanitize_filename(""), "unknown".to_string());
        assert_eq!(sanitize_filename("<>|"), "unnamed".to_string());

        // 测试文件名截断 (确保不破坏UTF-8和扩展名)
        let very_long_name = format!("{}.flac", "旋律".repeat(80));
        let truncated = sanitize_filename(&very_long_name);
        assert!(truncated.len() <= constants::MAX_FILENAME_BYTES);
        assert!(truncated.ends_with(".flac"));
    }

    #[test]
    fn test_extension_from_url() {
        assert_eq!(extension_from_url("https://cdn.example.com/a/b/song.FLAC?sig=1"), "flac");
        assert_eq!(extension_from_url("https://cdn.example.com/a/b/song"), "mp3");
        assert_eq!(extension_from_url("/local/path/take.wav#t=3"), "wav");
        assert_eq!(extension_from_url(""), "mp3");
    }

    #[test]
    fn test_suggested_filename() {
        assert_eq!(
            suggested_filename(&track("Nova", "Night/Drive", "https://x/y.wav")),
            "Nova - Night Drive.wav"
        );
        assert_eq!(suggested_filename(&track("", "", "")), "track-7.mp3");
    }

    #[test]
    fn test_generate_batch_id_is_unique() {
        let a = generate_batch_id();
        let b = generate_batch_id();
        assert!(a.starts_with("batch_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_track_list() {
        let json = r#"[{"id": 1, "displayName": "A", "artist": "X", "sourceURL": "https://h/a.mp3"}]"#;
        let tracks = parse_track_list(json).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].source_url, "https://h/a.mp3");

        let lines = "# 注释\n2\tB\tY\thttps://h/b.wav\n\n3\tC\n";
        let tracks = parse_track_list(lines).unwrap();
        assert_eq!(tracks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(tracks[1].artist, "");

        assert!(parse_track_list("abc\tB").is_err());
    }
}
