use url::{ParseError, Url};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Only `http` and `https` endpoints can carry OHTTP requests.
    UnsupportedScheme(String),
    MissingHost,
    Parse(ParseError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnsupportedScheme(scheme) => write!(f, "URL scheme `{scheme}` is not allowed"),
            Error::MissingHost => write!(f, "URL has no host"),
            Error::Parse(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Error { Error::Parse(err) }
}

/// Conversion into an absolute network [`Url`].
///
/// Sealed: implemented for [`Url`] and string types only, in the manner of `reqwest::IntoUrl`.
pub trait IntoUrl: sealed::IntoUrlSealed {}

impl IntoUrl for Url {}
impl IntoUrl for &Url {}
impl IntoUrl for &str {}
impl IntoUrl for String {}
impl IntoUrl for &String {}

pub(crate) mod sealed {
    use super::*;

    pub trait IntoUrlSealed {
        fn into_url(self) -> Result<Url, Error>;
    }

    impl IntoUrlSealed for Url {
        fn into_url(self) -> Result<Url, Error> {
            match self.scheme() {
                "http" | "https" => {}
                other => return Err(Error::UnsupportedScheme(other.to_owned())),
            }
            if !self.has_host() {
                return Err(Error::MissingHost);
            }
            Ok(self)
        }
    }

    impl IntoUrlSealed for &Url {
        fn into_url(self) -> Result<Url, Error> { self.clone().into_url() }
    }

    impl IntoUrlSealed for &str {
        fn into_url(self) -> Result<Url, Error> { Url::parse(self)?.into_url() }
    }

    impl IntoUrlSealed for String {
        fn into_url(self) -> Result<Url, Error> { self.as_str().into_url() }
    }

    impl IntoUrlSealed for &String {
        fn into_url(self) -> Result<Url, Error> { self.as_str().into_url() }
    }
}

#[cfg(test)]
mod tests {
    use super::sealed::IntoUrlSealed;
    use super::*;

    #[test]
    fn web_schemes_are_accepted() {
        assert_eq!("http://localhost".into_url().expect("http").scheme(), "http");
        assert_eq!(String::from("https://localhost:8080").into_url().expect("https").port(), Some(8080));
    }

    #[test]
    fn other_schemes_are_rejected() {
        assert_eq!(
            "file:///etc/hosts".into_url().unwrap_err(),
            Error::UnsupportedScheme("file".to_owned())
        );
        assert!(matches!("not a url".into_url(), Err(Error::Parse(_))));
    }
}
