//! 上传文件扩展名白名单校验。

use std::collections::BTreeSet;

pub const DEFAULT_ALLOWED_EXTENSIONS: &str = "txt,pdf,png,jpg,jpeg,gif,zip,docx,mp4,mp3";

/// 允许上传的扩展名集合（统一小写、不含前导点）。
#[derive(Clone, Debug)]
pub struct ExtensionPolicy {
    allowed: BTreeSet<String>,
}

impl ExtensionPolicy {
    /// 由配置项构建白名单，兼容 `.png`、` PNG ` 等写法。
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = extensions
            .into_iter()
            .map(|ext| {
                ext.as_ref()
                    .trim()
                    .trim_start_matches('.')
                    .to_ascii_lowercase()
            })
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { allowed }
    }

    /// 判断文件名的最后一个后缀是否在白名单内。
    pub fn is_allowed(&self, filename: &str) -> bool {
        match extension_of(filename) {
            Some(ext) => self.allowed.contains(&ext.to_ascii_lowercase()),
            None => false,
        }
    }

    /// 按字母序返回白名单内的扩展名。
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// 带前导点的扩展名列表，用于展示与健康检查。
    pub fn dotted(&self) -> Vec<String> {
        self.extensions().map(|ext| format!(".{ext}")).collect()
    }
}

/// 取最后一个 `.` 之后的内容；没有点或以点结尾时返回 `None`。
pub fn extension_of(filename: &str) -> Option<&str> {
    let (_, ext) = filename.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_policy() -> ExtensionPolicy {
        ExtensionPolicy::new(DEFAULT_ALLOWED_EXTENSIONS.split(','))
    }

    #[test]
    fn accepts_listed_extension_in_any_case() {
        let policy = default_policy();
        assert!(policy.is_allowed("photo.png"));
        assert!(policy.is_allowed("PHOTO.PNG"));
        assert!(policy.is_allowed("Report.Pdf"));
    }

    #[test]
    fn rejects_missing_or_empty_extension() {
        let policy = default_policy();
        assert!(!policy.is_allowed("x"));
        assert!(!policy.is_allowed("x."));
        assert!(!policy.is_allowed(""));
    }

    #[test]
    fn only_final_suffix_counts() {
        let policy = ExtensionPolicy::new(["gz"]);
        assert!(policy.is_allowed("x.TAR.GZ"));
        assert!(!ExtensionPolicy::new(["tar"]).is_allowed("x.tar.gz"));
        assert!(!default_policy().is_allowed("invoice.pdf.exe"));
    }

    #[test]
    fn normalizes_configured_entries() {
        let policy = ExtensionPolicy::new([" .PNG ", "", "Mp3", "."]);
        assert_eq!(policy.extensions().collect::<Vec<_>>(), vec!["mp3", "png"]);
        assert_eq!(policy.dotted(), vec![".mp3", ".png"]);
    }
}
