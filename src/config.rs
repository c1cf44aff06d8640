use crate::perplexity::client::SessionOptions;
use crate::pool::types::TokenCredentials;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8123;
/// deep research 单次可达数分钟，默认给足 15 分钟。
const DEFAULT_TIMEOUT_SECS: u64 = 900;
const DEFAULT_POOL_CONFIG: &str = "token_pool_config.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// 上游请求超时（秒），来自 PERPLEXITY_TIMEOUT。
    pub timeout_secs: u64,
    /// socks5://[user[:pass]@]host[:port][#remark]
    pub socks_proxy: String,

    /// 管理接口写操作的 Bearer token。为空则不启用鉴权。
    pub admin_token: String,

    /// token 池配置文件路径。
    pub pool_config_path: String,

    /// 无配置文件时的单 token 兜底。
    pub csrf_token: String,
    pub session_token: String,

    pub debug: String,
    pub log_file: String,

    /// -stdio：以 stdio 工具服务进程运行。
    pub stdio: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "PERPLEXITY_TIMEOUT")]
    perplexity_timeout: Option<u64>,
    #[serde(alias = "SOCKS_PROXY")]
    socks_proxy: Option<String>,

    #[serde(alias = "PPLX_ADMIN_TOKEN")]
    pplx_admin_token: Option<String>,
    #[serde(alias = "PPLX_TOKEN_POOL_CONFIG")]
    pplx_token_pool_config: Option<String>,
    #[serde(alias = "PPLX_NEXT_AUTH_CSRF_TOKEN")]
    pplx_next_auth_csrf_token: Option<String>,
    #[serde(alias = "PPLX_SESSION_TOKEN")]
    pplx_session_token: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "LOG_FILE")]
    log_file: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            timeout_secs: raw.perplexity_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            socks_proxy: raw.socks_proxy.unwrap_or_default(),
            admin_token: raw.pplx_admin_token.unwrap_or_default(),
            pool_config_path: raw
                .pplx_token_pool_config
                .unwrap_or_else(|| DEFAULT_POOL_CONFIG.to_string()),
            csrf_token: raw.pplx_next_auth_csrf_token.unwrap_or_default(),
            session_token: raw.pplx_session_token.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            log_file: raw.log_file.unwrap_or_default(),
            stdio: false,
        };

        // 命令行覆盖：-stdio 切换进程角色，-debug <level> 调整日志
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-stdio" | "--stdio" => cfg.stdio = true,
                "-debug" => {
                    if let Some(v) = args.next() {
                        cfg.debug = v;
                    }
                }
                _ => {}
            }
        }

        cfg
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            socks_proxy: {
                let p = self.socks_proxy.trim();
                if p.is_empty() {
                    None
                } else {
                    Some(p.to_string())
                }
            },
            log_level: self.log_level(),
        }
    }

    /// 环境变量里的单 token（配置文件缺失时的退路）。
    pub fn env_token(&self) -> Option<TokenCredentials> {
        if self.csrf_token.is_empty() || self.session_token.is_empty() {
            return None;
        }
        Some(TokenCredentials::new(
            "default",
            self.csrf_token.clone(),
            self.session_token.clone(),
        ))
    }

    pub fn pool_config_path(&self) -> PathBuf {
        PathBuf::from(&self.pool_config_path)
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        if std::env::var_os(&key).is_some() {
            // 已显式设置的环境变量优先于 .env
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
