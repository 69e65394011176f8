//! Node identifiers.
//!
//! Every object in a script is addressed as `/pipeline`, `/pipeline/node` or
//! `/pipeline/node[port]`. Ports only make sense on processes.

use std::fmt;
use std::str::FromStr;

use crate::error::IdentError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Ident {
    pub pipeline: String,
    pub node: Option<String>,
    pub port: Option<String>,
}

impl Ident {
    pub fn pipeline(name: impl Into<String>) -> Self {
        Self {
            pipeline: name.into(),
            ..Self::default()
        }
    }

    pub fn node(pipeline: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            node: Some(node.into()),
            port: None,
        }
    }

    pub fn port(
        pipeline: impl Into<String>,
        node: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            node: Some(node.into()),
            port: Some(port.into()),
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port.as_deref()
    }
}

impl FromStr for Ident {
    type Err = IdentError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        if id.is_empty() {
            return Err(IdentError::EmptyIdent);
        }
        let Some(rest) = id.strip_prefix('/') else {
            return Err(IdentError::NotAbsolute { id: id.to_string() });
        };

        let mut segments: Vec<&str> = rest.split('/').collect();
        if segments.len() > 1 && segments.last() == Some(&"") {
            segments.pop();
        }

        match segments.as_slice() {
            [pipeline] if !pipeline.is_empty() => Ok(Self::pipeline(*pipeline)),
            [pipeline, combined] if !pipeline.is_empty() => {
                let (node, port) = split_port(combined);
                Ok(Self {
                    pipeline: pipeline.to_string(),
                    node: Some(node.to_string()).filter(|n| !n.is_empty()),
                    port: port.filter(|p| !p.is_empty()).map(str::to_string),
                })
            }
            [_, _, _, ..] => Err(IdentError::TooManySegments { id: id.to_string() }),
            _ => Err(IdentError::MissingPipeline { id: id.to_string() }),
        }
    }
}

/// Split `node[port]` into its parts. A bracket pair only counts as a port
/// when it closes the segment.
fn split_port(combined: &str) -> (&str, Option<&str>) {
    let (Some(open), Some(close)) = (combined.rfind('['), combined.rfind(']')) else {
        return (combined, None);
    };
    if close < open || close != combined.len() - 1 {
        return (combined, None);
    }
    (&combined[..open], Some(&combined[open + 1..close]))
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.pipeline)?;
        if self.node.is_none() && self.port.is_none() {
            return Ok(());
        }
        write!(f, "/{}", self.node.as_deref().unwrap_or(""))?;
        if let Some(port) = &self.port {
            write!(f, "[{port}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table() {
        let cases: Vec<(&str, Result<Ident, IdentError>)> = vec![
            ("/test", Ok(Ident::pipeline("test"))),
            ("/test/", Ok(Ident::pipeline("test"))),
            ("/test/process", Ok(Ident::node("test", "process"))),
            ("/test/process[port]", Ok(Ident::port("test", "process", "port"))),
            ("/test/process[]", Ok(Ident::node("test", "process"))),
            ("/bad/por[]t", Ok(Ident::node("bad", "por[]t"))),
            ("/bad/port]x[", Ok(Ident::node("bad", "port]x["))),
            ("", Err(IdentError::EmptyIdent)),
            ("/", Err(IdentError::MissingPipeline { id: "/".into() })),
            ("test/process", Err(IdentError::NotAbsolute { id: "test/process".into() })),
            (
                "/too/many/paths",
                Err(IdentError::TooManySegments { id: "/too/many/paths".into() }),
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(input.parse::<Ident>(), expected, "parsing {input:?}");
        }
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["/test", "/test/process", "/test/process[port]"] {
            let ident: Ident = text.parse().unwrap();
            assert_eq!(ident.to_string(), text);
        }
    }

    #[test]
    fn test_accessors() {
        let ident: Ident = "/p/cat[stdout]".parse().unwrap();
        assert_eq!(ident.pipeline, "p");
        assert_eq!(ident.node_name(), Some("cat"));
        assert_eq!(ident.port_name(), Some("stdout"));
    }
}
