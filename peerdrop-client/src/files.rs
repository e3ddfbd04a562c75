use std::path::{Path, PathBuf};

use peerdrop_core::MAX_FILE_NAME_LEN;
use tokio::{fs, io::AsyncWriteExt};

const MAX_COLLISION_SUFFIX: u32 = 200;

/// Reduces a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    let mut out = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        if matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || ch.is_control() {
            out.push('_');
        } else {
            out.push(ch);
        }
    }

    let out = out.trim_start_matches('.').to_owned();
    if out.is_empty() {
        return "file.bin".to_owned();
    }
    truncate_to_char_boundary(out, MAX_FILE_NAME_LEN)
}

fn truncate_to_char_boundary(mut value: String, max: usize) -> String {
    if value.len() > max {
        let mut end = max;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}

/// First free path for `file_name` in `dir`, using `stem (n).ext` on collision.
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let safe = sanitize_file_name(file_name);
    let first = dir.join(&safe);
    if !first.exists() {
        return first;
    }

    let safe_path = Path::new(&safe);
    let stem = safe_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = safe_path.extension().and_then(|s| s.to_str());
    for i in 1..=MAX_COLLISION_SUFFIX {
        let candidate = match ext {
            Some(ext) => dir.join(format!("{stem} ({i}).{ext}")),
            None => dir.join(format!("{stem} ({i})")),
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    dir.join(format!("{stem}-{}", std::process::id()))
}

/// Writes a completed download and returns where it landed.
pub async fn save_download(
    dir: &Path,
    file_name: &str,
    payload: &[u8],
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let dest = unique_destination(dir, file_name);
    let tmp_name = dest
        .file_name()
        .map(|name| format!("{}.part", name.to_string_lossy()))
        .unwrap_or_else(|| "download.part".to_owned());
    let tmp = dest.with_file_name(tmp_name);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(payload).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&tmp, &dest).await?;
    Ok(dest)
}

/// Best-effort MIME type from the file extension.
pub fn guess_mime(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => return None,
    };
    Some(mime.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_and_controls_are_replaced() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a\\b:c\n.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_file_name("   "), "file.bin");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    #[test]
    fn long_names_are_cut_on_char_boundary() {
        let name = "é".repeat(200);
        let safe = sanitize_file_name(&name);
        assert!(safe.len() <= MAX_FILE_NAME_LEN);
        assert!(safe.chars().all(|ch| ch == 'é'));
    }

    #[test]
    fn collisions_get_numbered() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("photo.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("photo (1).jpg"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "photo.jpg"),
            dir.path().join("photo (2).jpg")
        );
        assert_eq!(
            unique_destination(dir.path(), "notes"),
            dir.path().join("notes")
        );
    }

    #[tokio::test]
    async fn save_download_creates_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("inbox");
        let path = save_download(&target, "hello.txt", b"hi").await.unwrap();
        assert_eq!(path, target.join("hello.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hi");
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(guess_mime(Path::new("a/photo.JPG")).as_deref(), Some("image/jpeg"));
        assert_eq!(guess_mime(Path::new("archive.tar.xz")), None);
        assert_eq!(guess_mime(Path::new("Makefile")), None);
    }
}
