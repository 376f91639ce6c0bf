//! Configuration snippets
//!
//! Each snippet is a small YAML document. [`document`] concatenates the
//! attribute, handler, instance and rule lists of the snippets it is given.
//! Handlers and instances live in the default namespace unless the snippet
//! says otherwise.

use attrmesh_core::{Error, Result, config::ConfigDocument};

pub const ATTRIBUTES: &str = r#"
attributes:
  ident: STRING
  destination.name: STRING
  generated.attr: STRING
"#;

pub const HANDLER_ACHECK1: &str = r#"
handlers:
  - name: hcheck1
    adapter: acheck
"#;

pub const HANDLER_ACHECK2: &str = r#"
handlers:
  - name: hcheck2
    adapter: acheck
"#;

pub const HANDLER_AREPORT1: &str = r#"
handlers:
  - name: hreport1
    adapter: areport
"#;

pub const HANDLER_AREPORT2: &str = r#"
handlers:
  - name: hreport2
    adapter: areport
"#;

pub const HANDLER_AQUOTA1: &str = r#"
handlers:
  - name: hquota1
    adapter: aquota
"#;

pub const HANDLER_AQUOTA2: &str = r#"
handlers:
  - name: hquota2
    adapter: aquota
"#;

pub const HANDLER_APA1: &str = r#"
handlers:
  - name: hapa1
    adapter: apa
"#;

pub const INSTANCE_CHECK1: &str = r#"
instances:
  - name: icheck1
    template: tcheck
"#;

pub const INSTANCE_CHECK2: &str = r#"
instances:
  - name: icheck2
    template: tcheck
"#;

/// Instance carrying the identity attribute as a field
pub const INSTANCE_CHECK_IDENT: &str = r#"
instances:
  - name: icheckident
    template: tcheck
    params:
      ident: ident
"#;

pub const INSTANCE_REPORT1: &str = r#"
instances:
  - name: ireport1
    template: treport
"#;

pub const INSTANCE_REPORT2: &str = r#"
instances:
  - name: ireport2
    template: treport
"#;

pub const INSTANCE_QUOTA1: &str = r#"
instances:
  - name: iquota1
    template: tquota
"#;

pub const INSTANCE_QUOTA2: &str = r#"
instances:
  - name: iquota2
    template: tquota
"#;

/// Attribute generator writing `generated.attr` from the handler's
/// `generated_attr` output
pub const INSTANCE_APA1: &str = r#"
instances:
  - name: iapa1
    template: tapa
    params:
      attribute_bindings:
        generated.attr: $out.generated_attr
"#;

pub const RULE_CHECK1: &str = r#"
rules:
  - name: rcheck1
    actions:
      - handler: hcheck1.acheck
        instances: [icheck1.tcheck]
"#;

/// Two instances on one handler, dispatched as one destination
pub const RULE_CHECK1_TWO_INSTANCES: &str = r#"
rules:
  - name: rcheck1
    actions:
      - handler: hcheck1.acheck
        instances: [icheck1.tcheck, icheck2.tcheck]
"#;

pub const RULE_CHECK2: &str = r#"
rules:
  - name: rcheck2
    actions:
      - handler: hcheck2.acheck
        instances: [icheck2.tcheck]
"#;

pub const RULE_CHECK_IDENT: &str = r#"
rules:
  - name: rcheckident
    actions:
      - handler: hcheck1.acheck
        instances: [icheckident.tcheck]
"#;

pub const RULE_CHECK1_MATCH_FOO: &str = r#"
rules:
  - name: rcheck1
    match: match(destination.name, "foo*")
    actions:
      - handler: hcheck1.acheck
        instances: [icheck1.tcheck]
"#;

/// Match clause that does not evaluate to a boolean
pub const RULE_CHECK1_NON_BOOLEAN_MATCH: &str = r#"
rules:
  - name: rcheck1
    match: destination.name
    actions:
      - handler: hcheck1.acheck
        instances: [icheck1.tcheck]
"#;

/// Rule of namespace `ns2` using the default namespace's handler
pub const RULE_CHECK2_NS2: &str = r#"
rules:
  - name: rcheck2
    namespace: ns2
    actions:
      - handler: hcheck2.acheck.istio-system
        instances: [icheck2.tcheck.istio-system]
"#;

pub const RULE_REPORT1: &str = r#"
rules:
  - name: rreport1
    actions:
      - handler: hreport1.areport
        instances: [ireport1.treport, ireport2.treport]
"#;

pub const RULE_REPORT2: &str = r#"
rules:
  - name: rreport2
    actions:
      - handler: hreport2.areport
        instances: [ireport2.treport]
"#;

pub const RULE_QUOTA1: &str = r#"
rules:
  - name: rquota1
    actions:
      - handler: hquota1.aquota
        instances: [iquota1.tquota]
"#;

pub const RULE_QUOTA2: &str = r#"
rules:
  - name: rquota2
    actions:
      - handler: hquota2.aquota
        instances: [iquota2.tquota]
"#;

pub const RULE_APA1: &str = r#"
rules:
  - name: rapa1
    actions:
      - handler: hapa1.apa
        instances: [iapa1.tapa]
"#;

/// Rule referring to a handler nobody declared
pub const RULE_CHECK_UNKNOWN_HANDLER: &str = r#"
rules:
  - name: rcheckunknown
    actions:
      - handler: hmissing.acheck
        instances: [icheck1.tcheck]
"#;

/// Parse and concatenate snippets into one document
pub fn document(parts: &[&str]) -> Result<ConfigDocument> {
    let mut doc = ConfigDocument::default();
    for part in parts {
        let piece: ConfigDocument =
            serde_yaml::from_str(part).map_err(|e| Error::Config(e.to_string()))?;
        doc.attributes.extend(&piece.attributes);
        doc.handlers.extend(piece.handlers);
        doc.instances.extend(piece.instances);
        doc.rules.extend(piece.rules);
    }
    Ok(doc)
}
