//! Resolved endpoint descriptors and the collaborator interfaces through
//! which the session obtains them. How the descriptors are produced (an XML
//! document fetched over HTTP, a static configuration, a hardcoded list in
//! tests) is outside the core; the session only consumes the resolved form.

use rand::Rng;

/// One resolved endpoint for a named game service: the client-class tag
/// identifying a compatible transport client, the address, and any extra
/// tagged string parameters the deployment carries along.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Endpoint {
    pub client_class: String,
    pub host: String,
    pub port: u16,
    pub params: Vec<(String, String)>,
}

impl Endpoint {
    #[inline]
    pub fn new<S: Into<String>>(client_class: S, host: S, port: u16) -> Endpoint {
        Endpoint {
            client_class: client_class.into(),
            host: host.into(),
            port,
            params: Vec::new(),
        }
    }

    /// Looks up an additional tagged parameter by name.
    #[inline]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Source of endpoint descriptors for a named game. Invoked once per
/// connect attempt so a fresh discovery result is used for fail-over.
pub trait Locator {
    fn locate(&mut self, game: &str) -> Vec<Endpoint>;
}

/// A fixed endpoint list. The usual locator for tests and for deployments
/// with out-of-band configuration.
pub struct StaticLocator {
    endpoints: Vec<Endpoint>,
}

impl StaticLocator {
    #[inline]
    pub fn new(endpoints: Vec<Endpoint>) -> StaticLocator {
        StaticLocator { endpoints }
    }
}

impl Locator for StaticLocator {
    #[inline]
    fn locate(&mut self, _game: &str) -> Vec<Endpoint> {
        self.endpoints.clone()
    }
}

/// Chooses which endpoint a connect attempt targets.
pub trait EndpointPolicy {
    /// Picks one endpoint compatible with `client_class`, or `None` when
    /// the discovery result offers no match.
    fn choose<'a>(&mut self, endpoints: &'a [Endpoint], client_class: &str)
        -> Option<&'a Endpoint>;
}

/// Default policy: a uniformly random pick among the endpoints whose
/// client class matches.
pub struct UniformPolicy;

impl EndpointPolicy for UniformPolicy {
    fn choose<'a>(
        &mut self,
        endpoints: &'a [Endpoint],
        client_class: &str,
    ) -> Option<&'a Endpoint> {
        let matching: Vec<&Endpoint> = endpoints
            .iter()
            .filter(|endpoint| endpoint.client_class == client_class)
            .collect();

        match matching.len() {
            0 => None,
            count => Some(matching[rand::thread_rng().gen_range(0..count)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("stream", "alpha.example", 4000),
            Endpoint::new("stream", "beta.example", 4001),
            Endpoint::new("datagram", "gamma.example", 4002),
        ]
    }

    #[test]
    fn test_uniform_policy_matches_class() {
        let endpoints = endpoints();
        let mut policy = UniformPolicy;

        for _ in 0..20 {
            let chosen = policy.choose(&endpoints, "stream").unwrap();
            assert_eq!(chosen.client_class, "stream");
        }
    }

    #[test]
    fn test_uniform_policy_no_match() {
        let endpoints = endpoints();
        let mut policy = UniformPolicy;

        assert_eq!(policy.choose(&endpoints, "carrier-pigeon"), None);
    }

    #[test]
    fn test_uniform_policy_single_candidate() {
        let endpoints = endpoints();
        let mut policy = UniformPolicy;

        let chosen = policy.choose(&endpoints, "datagram").unwrap();

        assert_eq!(chosen.host, "gamma.example");
    }

    #[test]
    fn test_params() {
        let mut endpoint = Endpoint::new("stream", "alpha.example", 4000);
        endpoint
            .params
            .push(("region".to_owned(), "eu".to_owned()));

        assert_eq!(endpoint.param("region"), Some("eu"));
        assert_eq!(endpoint.param("zone"), None);
    }

    #[test]
    fn test_static_locator() {
        let mut locator = StaticLocator::new(endpoints());

        assert_eq!(locator.locate("any-game").len(), 3);
    }
}
