use crate::size::Limits;

const TEMPLATE: &str = include_str!("../assets/index.html");

pub fn render(limits: &Limits) -> String {
    TEMPLATE
        .replace("__DOWNLOAD_PATH__", &limits.default_path())
        .replace("__TOTAL_BYTES__", &limits.default_bytes.to_string())
}
