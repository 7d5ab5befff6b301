use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    pub protocol: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub query: String,
}

impl Uri {
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return Self::default();
        }

        let (protocol, parsed) = if input.contains("://") {
            (None, Url::parse(input))
        } else {
            (Some(String::new()), Url::parse(&format!("http://{input}")))
        };

        let Ok(url) = parsed else {
            return Self::split_raw(input);
        };

        Self {
            protocol: protocol.unwrap_or_else(|| url.scheme().to_string()),
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port().map(|port| port.to_string()).unwrap_or_default(),
            path: url.path().to_string(),
            query: url.query().unwrap_or_default().to_string(),
        }
    }

    pub fn authority(&self) -> String {
        if self.port.is_empty() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn request_target(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        if self.query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", self.query)
        }
    }

    // Fallback for inputs `url` refuses, e.g. hosts with stray characters.
    fn split_raw(input: &str) -> Self {
        let rest = input
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(input);
        let (before_query, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (authority, path) = match before_query.find('/') {
            Some(index) => before_query.split_at(index),
            None => (before_query, ""),
        };
        let (host, port) = authority.split_once(':').unwrap_or((authority, ""));

        Self {
            protocol: input
                .split_once("://")
                .map(|(scheme, _)| scheme.to_string())
                .unwrap_or_default(),
            host: host.to_string(),
            port: port.to_string(),
            path: path.to_string(),
            query: query.to_string(),
        }
    }
}
