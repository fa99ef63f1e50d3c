//! Template rendering for LDIF sources.
//!
//! Before parsing, an LDIF file may run through the template engine with a
//! small set of well-known variables (BaseDN, Company, MailDomain plus
//! user-supplied extras) and functions. The setter functions mutate shared
//! state mid-render, so variables resolve through a dynamic object instead
//! of a frozen context.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minijinja::value::{Object, Value};
use minijinja::{Environment, ErrorKind};

use crate::error::{Error, Result};
use crate::ldif::LdifOptions;

const MAX_FILE_BASE64_SIZE: u64 = 1024 * 1024;

const AUTO_INCREMENT_START: u64 = 1000;

#[derive(Debug)]
struct TemplateVars {
    vars: Mutex<HashMap<String, String>>,
}

/// Render an LDIF template to plain LDIF text.
pub fn render(source: &str, options: &LdifOptions) -> Result<String> {
    let mut vars = HashMap::from([
        ("Company".to_string(), "Default".to_string()),
        ("BaseDN".to_string(), "dc=lg,dc=local".to_string()),
        ("MailDomain".to_string(), "lg.local".to_string()),
    ]);
    if !options.base_dn.is_empty() {
        vars.insert("BaseDN".to_string(), options.base_dn.clone());
    }
    if !options.default_company.is_empty() {
        vars.insert("Company".to_string(), options.default_company.clone());
    }
    if !options.default_mail_domain.is_empty() {
        vars.insert("MailDomain".to_string(), options.default_mail_domain.clone());
    }
    for (k, v) in &options.template_extra_vars {
        vars.insert(k.clone(), v.clone());
    }

    let shared = Arc::new(TemplateVars {
        vars: Mutex::new(vars),
    });
    let counter = Arc::new(AtomicU64::new(AUTO_INCREMENT_START));

    let mut env = Environment::new();

    for (name, key) in [
        ("WithCompany", "Company"),
        ("WithBaseDN", "BaseDN"),
        ("WithMailDomain", "MailDomain"),
    ] {
        let shared = shared.clone();
        env.add_function(name, move |value: String| -> String {
            shared
                .vars
                .lock()
                .expect("template vars lock")
                .insert(key.to_string(), value);
            String::new()
        });
    }

    {
        let counter = counter.clone();
        env.add_function("AutoIncrement", move |start: Option<u64>| -> u64 {
            match start {
                Some(start) => {
                    counter.store(start, Ordering::Relaxed);
                    start
                }
                None => counter.fetch_add(1, Ordering::Relaxed) + 1,
            }
        });
    }

    env.add_function("formatAsBase64", |value: String| -> String {
        BASE64.encode(value.as_bytes())
    });

    env.add_function(
        "formatAsFileBase64",
        |path: String| -> std::result::Result<String, minijinja::Error> {
            let file = std::fs::File::open(&path).map_err(|e| {
                minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("formatAsFileBase64 open failed: {e}"),
                )
            })?;
            let mut contents = Vec::new();
            file.take(MAX_FILE_BASE64_SIZE + 1)
                .read_to_end(&mut contents)
                .map_err(|e| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("formatAsFileBase64 read failed: {e}"),
                    )
                })?;
            if contents.len() as u64 > MAX_FILE_BASE64_SIZE {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("formatAsFileBase64 size limit exceeded: {path}"),
                ));
            }
            Ok(BASE64.encode(&contents))
        },
    );

    let template = env
        .template_from_str(source)
        .map_err(|e| Error::LdifTemplate(e.to_string()))?;
    template
        .render(Value::from_object(SharedContext(shared)))
        .map_err(|e| Error::LdifTemplate(e.to_string()))
}

/// Context facade: attribute lookups read the mutable variable map so that
/// setter calls earlier in the template are visible later in it.
#[derive(Debug)]
struct SharedContext(Arc<TemplateVars>);

impl Object for SharedContext {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;
        self.0
            .vars
            .lock()
            .expect("template vars lock")
            .get(key)
            .map(Value::from)
    }
}
