use crate::core::config::data::Config;

pub fn list_personas(config: &Config) {
    print!("{}", format_personas(config));
}

pub fn format_personas(config: &Config) -> String {
    let mut out = String::from("🏛  Available philosophers:\n\n");
    for persona in &config.personas {
        out.push_str(&format!("  • {} ({})\n", persona.name, persona.id));
    }
    out.push_str("\n💡 Chat with one of them:\n   chatosophy chat --persona <id>\n");
    out
}
