//! Item identifiers.
//!
//! # ULID ベースの ID
//! 呼び出し側が id を渡さない場合は ULID を生成します。
//! - **時刻でソート可能**: ディレクトリ一覧が生成順に並ぶ
//! - **分散生成可能**: 複数プロセスが同じディレクトリに書いても衝突しない
//!
//! Ids are plain strings on the wire because callers may supply their own
//! (report serial numbers, converter file names, ...).

use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Generate a new item id.
pub fn generate_item_id() -> String {
    Ulid::new().to_string()
}

/// Characters allowed verbatim in an on-disk file stem.
fn is_stem_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Longest stem handed out. Leaves room for `.error.info.tmp` under the
/// usual 255-byte filename limit.
pub const MAX_STEM_LEN: usize = 200;

/// Hex chars of digest appended to rewritten stems.
const DIGEST_HEX_LEN: usize = 8;

/// Map an item id to a file stem that is safe on every filesystem.
///
/// Ids made only of `[A-Za-z0-9_-]` and no longer than [`MAX_STEM_LEN`] are
/// used as-is. Anything else is sanitized, cut to fit, and suffixed with a
/// short digest of the original id, so two ids that end up with the same
/// text still get distinct stems.
pub fn file_stem(id: &str) -> String {
    if !id.is_empty() && id.len() <= MAX_STEM_LEN && id.chars().all(is_stem_char) {
        return id.to_string();
    }

    let sanitized: String = id
        .chars()
        .map(|c| if is_stem_char(c) { c } else { '_' })
        .take(MAX_STEM_LEN - DIGEST_HEX_LEN - 1)
        .collect();
    let digest = Sha256::digest(id.as_bytes());
    format!("{}-{}", sanitized, hex::encode(&digest[..DIGEST_HEX_LEN / 2]))
}
