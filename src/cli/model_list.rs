//! Model listing functionality
//!
//! Models come from the catalog; nothing is fetched from the providers.

use crate::core::config::data::Config;

pub fn list_models(config: &Config) {
    print!("{}", format_models(config));
}

pub fn format_models(config: &Config) -> String {
    let default = config.initial_model().map(|m| m.id.as_str());

    let mut out = String::from("🤖 Available Models\n");
    out.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");
    for model in &config.models {
        let marker = if Some(model.id.as_str()) == default {
            " (default)"
        } else {
            ""
        };
        out.push_str(&format!(
            "  • {} [{}] {}{marker}\n",
            model.id,
            model.provider,
            model.label()
        ));
    }
    out
}
