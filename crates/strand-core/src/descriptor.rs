//! Method descriptors: what a call targets and how it streams.

use std::fmt;

/// The four RPC call patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Single request, single response.
    Unary,
    /// Many requests, single response.
    ClientStreaming,
    /// Single request, many responses.
    ServerStreaming,
    /// Many requests, many responses.
    Bidirectional,
}

impl CallKind {
    pub fn client_streams(self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::Bidirectional)
    }

    pub fn server_streams(self) -> bool {
        matches!(self, CallKind::ServerStreaming | CallKind::Bidirectional)
    }
}

/// Errors from descriptor construction and path parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    EmptyService,
    EmptyMethod,
    /// Service or method names may not contain `/`.
    SlashInName(String),
    /// Wire path does not match `/<service>/<method>`.
    MalformedPath(String),
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::EmptyService => write!(f, "service name cannot be empty"),
            DescriptorError::EmptyMethod => write!(f, "method name cannot be empty"),
            DescriptorError::SlashInName(name) => {
                write!(f, "name {:?} contains a slash", name)
            }
            DescriptorError::MalformedPath(path) => {
                write!(f, "malformed method path {:?}", path)
            }
        }
    }
}

impl std::error::Error for DescriptorError {}

/// Identifies a method: service, method name, and call pattern.
///
/// The wire form is the path `/<service>/<method>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: String,
    method: String,
    kind: CallKind,
}

impl MethodDescriptor {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        kind: CallKind,
    ) -> Result<Self, DescriptorError> {
        let service = service.into();
        let method = method.into();
        if service.is_empty() {
            return Err(DescriptorError::EmptyService);
        }
        if method.is_empty() {
            return Err(DescriptorError::EmptyMethod);
        }
        if service.contains('/') {
            return Err(DescriptorError::SlashInName(service));
        }
        if method.contains('/') {
            return Err(DescriptorError::SlashInName(method));
        }
        Ok(MethodDescriptor {
            service,
            method,
            kind,
        })
    }

    pub fn unary(
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        Self::new(service, method, CallKind::Unary)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// The wire path, `/<service>/<method>`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    /// Parse a wire path back into service and method names.
    pub fn parse_path(path: &str) -> Result<(&str, &str), DescriptorError> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| DescriptorError::MalformedPath(path.to_string()))?;
        let (service, method) = rest
            .split_once('/')
            .ok_or_else(|| DescriptorError::MalformedPath(path.to_string()))?;
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return Err(DescriptorError::MalformedPath(path.to_string()));
        }
        Ok((service, method))
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.service, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_format_and_parse_roundtrip() {
        let desc = MethodDescriptor::new("echo.Echo", "Say", CallKind::Unary).unwrap();
        assert_eq!(desc.path(), "/echo.Echo/Say");
        let path = desc.path();
        let (service, method) = MethodDescriptor::parse_path(&path).unwrap();
        assert_eq!(service, "echo.Echo");
        assert_eq!(method, "Say");
    }

    #[test]
    fn rejects_empty_and_slashed_names() {
        assert_eq!(
            MethodDescriptor::new("", "Say", CallKind::Unary).err(),
            Some(DescriptorError::EmptyService)
        );
        assert_eq!(
            MethodDescriptor::new("svc", "", CallKind::Unary).err(),
            Some(DescriptorError::EmptyMethod)
        );
        assert!(matches!(
            MethodDescriptor::new("a/b", "Say", CallKind::Unary),
            Err(DescriptorError::SlashInName(_))
        ));
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["", "/", "noslash", "/onlyservice", "/a/b/c", "//m", "/s/"] {
            assert!(
                MethodDescriptor::parse_path(path).is_err(),
                "path {:?} should be rejected",
                path
            );
        }
    }

    #[test]
    fn kind_predicates() {
        assert!(!CallKind::Unary.client_streams());
        assert!(!CallKind::Unary.server_streams());
        assert!(CallKind::ClientStreaming.client_streams());
        assert!(CallKind::ServerStreaming.server_streams());
        assert!(CallKind::Bidirectional.client_streams());
        assert!(CallKind::Bidirectional.server_streams());
    }
}
