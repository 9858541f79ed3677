use super::error::TelemetryError;
use std::fmt;

/// Values substituted into a scope template.
#[derive(Debug, Clone, Copy)]
pub struct ScopeVariables<'a> {
    pub host: &'a str,
    pub tm_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Host,
    TmId,
}

/// Parsed scope template such as `<host>.taskmanager.<tm_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFormat {
    template: String,
    segments: Vec<Segment>,
}

impl ScopeFormat {
    pub fn parse(template: &str) -> Result<Self, TelemetryError> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('<') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('>')
                .ok_or_else(|| TelemetryError::MalformedScopeFormat(template.to_string()))?;
            let variable = &after[..close];
            segments.push(match variable {
                "host" => Segment::Host,
                "tm_id" => Segment::TmId,
                other => {
                    return Err(TelemetryError::UnknownScopeVariable {
                        template: template.to_string(),
                        variable: other.to_string(),
                    })
                }
            });
            rest = &after[close + 1..];
        }
        if rest.contains('>') {
            return Err(TelemetryError::MalformedScopeFormat(template.to_string()));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            template: template.to_string(),
            segments,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn format(&self, variables: &ScopeVariables<'_>) -> String {
        let mut scope = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => scope.push_str(text),
                Segment::Host => scope.push_str(&sanitize(variables.host)),
                Segment::TmId => scope.push_str(&sanitize(variables.tm_id)),
            }
        }
        scope
    }
}

impl fmt::Display for ScopeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Joins a formatted scope and a metric name.
pub fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '.' || c.is_whitespace() { '-' } else { c })
        .collect()
}
