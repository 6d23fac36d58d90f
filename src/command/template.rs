use std::collections::BTreeMap;

/// Renders `{{ variable }}` placeholders in command strings and server
/// arguments. A leading dot (`{{.node_ip}}`) is accepted.
#[derive(Debug, Clone, Default)]
pub struct Templater {
    variables: BTreeMap<String, String>,
}

impl Templater {
    pub fn new(variables: BTreeMap<String, String>) -> Self {
        Self { variables }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn render(&self, raw: &str) -> Result<String, String> {
        let mut output = String::with_capacity(raw.len());
        let mut rest = raw;

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| format!("unterminated placeholder in {:?}", raw))?;

            let key = after[..end].trim();
            let key = key.strip_prefix('.').unwrap_or(key);
            let value = self
                .variables
                .get(key)
                .ok_or_else(|| format!("unknown variable {:?}", key))?;
            output.push_str(value);

            rest = &after[end + 2..];
        }

        output.push_str(rest);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templater() -> Templater {
        Templater::default()
            .with_variable("node_ip", "10.0.0.1")
            .with_variable("cluster_name", "k8s-tew")
    }

    #[test]
    fn renders_plain_text_unchanged() {
        assert_eq!(templater().render("echo hello").unwrap(), "echo hello");
    }

    #[test]
    fn renders_multiple_placeholders() {
        let rendered = templater()
            .render("ping {{node_ip}} # {{ .cluster_name }}")
            .unwrap();
        assert_eq!(rendered, "ping 10.0.0.1 # k8s-tew");
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let err = templater().render("{{ missing }}").unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        assert!(templater().render("echo {{node_ip").is_err());
    }
}
