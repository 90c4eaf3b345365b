//! Response fields and the CGI header block.

use crate::error::OutputError;
use crate::status;

/// Authorizer variables travel as response fields under this prefix.
pub(crate) const VARIABLE_PREFIX: &str = "Variable-";

// The status line is synthesized from the pending status code; letting
// applications set it directly would emit it twice.
const RESERVED: &str = "Status";

/// An ordered, case-insensitive multimap of CGI response fields.
///
/// Field order is preserved as written. `set` replaces every field of that
/// name, `add` appends another one.
#[derive(Debug, Default)]
pub(crate) struct FieldMap {
    fields: Vec<(String, String)>,
}

impl FieldMap {
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), OutputError> {
        let name = validate(name)?;
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.fields.push((name, value.trim().to_string()));
        Ok(())
    }

    pub fn add(&mut self, name: &str, value: &str) -> Result<(), OutputError> {
        let name = validate(name)?;
        self.fields.push((name, value.trim().to_string()));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// True for field names in the authorizer's reserved `Variable-` namespace.
pub(crate) fn is_variable(name: &str) -> bool {
    name.trim()
        .get(..VARIABLE_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(VARIABLE_PREFIX))
}

fn validate(name: &str) -> Result<String, OutputError> {
    let name = name.trim();

    if name.is_empty() || name.contains([':', '\r', '\n']) {
        return Err(OutputError::InvalidFieldName(name.to_string()));
    }
    if name.eq_ignore_ascii_case(RESERVED) {
        return Err(OutputError::ReservedField(name.to_string()));
    }

    Ok(name.to_string())
}

/// Renders the CGI header block the response body is prefixed with.
///
/// `Status: <code> <reason>`, one line per field, then a blank line, all
/// CRLF-terminated and UTF-8 encoded.
pub(crate) fn render_header_block(code: u16, fields: &FieldMap) -> Vec<u8> {
    let mut block = String::new();
    block.push_str("Status: ");
    block.push_str(&status::status_line(code));
    block.push_str("\r\n");
    for (name, value) in fields.iter() {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    block.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut fields = FieldMap::default();
        fields.add("Content-Type", "text/plain").unwrap();
        fields.add("X-Extra", "1").unwrap();
        fields.set("content-type", "text/html").unwrap();

        let rendered: Vec<_> = fields.iter().collect();
        assert_eq!(rendered, vec![("X-Extra", "1"), ("content-type", "text/html")]);
    }

    #[test]
    fn add_keeps_repeated_fields_in_order() {
        let mut fields = FieldMap::default();
        fields.add("Set-Cookie", "a=1").unwrap();
        fields.add("Set-Cookie", "b=2").unwrap();

        let rendered: Vec<_> = fields.iter().collect();
        assert_eq!(rendered, vec![("Set-Cookie", "a=1"), ("Set-Cookie", "b=2")]);
    }

    #[test]
    fn status_is_reserved() {
        let mut fields = FieldMap::default();
        assert_matches!(fields.set("Status", "200"), Err(OutputError::ReservedField(_)));
        assert_matches!(fields.add("status", "200"), Err(OutputError::ReservedField(_)));
    }

    #[test]
    fn names_are_trimmed_and_validated() {
        let mut fields = FieldMap::default();
        fields.set("  X-Trim  ", "  v  ").unwrap();
        assert_eq!(fields.iter().next(), Some(("X-Trim", "v")));

        assert_matches!(fields.set("", "v"), Err(OutputError::InvalidFieldName(_)));
        assert_matches!(fields.set("a:b", "v"), Err(OutputError::InvalidFieldName(_)));
    }

    #[test]
    fn header_block_layout() {
        let mut fields = FieldMap::default();
        fields.set("Content-Type", "text/plain").unwrap();

        let block = render_header_block(200, &fields);
        assert_eq!(
            block,
            b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\n"
        );

        let block = render_header_block(299, &FieldMap::default());
        assert_eq!(block, b"Status: 299 UNKNOWN-RESPONSE-299\r\n\r\n");
    }
}
