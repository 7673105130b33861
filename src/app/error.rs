use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("not logged in; call login first")]
    NotAuthenticated,

    #[error("session expired and re-login failed; please log in again")]
    SessionExpired,

    #[error("webdriver error: {0}")]
    WebDriver(String),

    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("downloaded file is empty: {path}")]
    EmptyDownload { path: String },

    #[error("download of {url} timed out after {secs}s")]
    DownloadTimeout { url: String, secs: u64 },

    #[error("too many redirects ({hops}) starting at {url}")]
    TooManyRedirects { url: String, hops: usize },

    #[error("redirect from {url} has no location")]
    MissingRedirectLocation { url: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl PortalError {
    /// Transient failures that a bounded retry may clear.
    pub fn is_retriable(&self) -> bool {
        match self {
            PortalError::WebDriver(_) | PortalError::Navigation { .. } => true,
            PortalError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            PortalError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PortalError>;
