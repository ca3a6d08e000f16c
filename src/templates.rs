use minijinja::value::Value;
use minijinja::Environment;

/// The fixed table of user-facing message templates. Built once at startup
/// and injected through `AppState`; the pipeline only ever selects a key
/// and supplies substitution values.

const TEMPLATE_TABLE: &[(&str, &str)] = &[
    (
        "binding_confirmed",
        "You're all set{% if name %}, {{ name }}{% endif %}! This number is now \
         linked to your {% if show %}{{ show }} {% endif %}assistant. Just send a \
         message whenever you need help.",
    ),
    (
        "code_not_recognized",
        "That access code doesn't look right. Double-check the code on your pass \
         (it looks like SC-XXXXXX) and send it again.",
    ),
    (
        "code_linked_elsewhere",
        "This access code is already linked to a different phone number. If you \
         believe this is a mistake, contact your company manager.",
    ),
    (
        "seat_expired",
        "Your access to this assistant has expired. Contact your company manager \
         to renew it.",
    ),
    (
        "seat_revoked",
        "Your access to this assistant has been revoked. Contact your company \
         manager if you have questions.",
    ),
    (
        "number_not_enabled",
        "This number isn't linked to an assistant yet. Send your access code (it \
         looks like SC-XXXXXX) to get started.",
    ),
    (
        "rate_limited",
        "You're sending messages a little too quickly. Please wait a moment and \
         try again.",
    ),
    (
        "escalation",
        "It sounds like this could be urgent. This assistant can't help with \
         medical emergencies. If you or someone else is in danger, call your \
         local emergency number now. You can also reach our support team at \
         {{ support_contact }}.",
    ),
    (
        "resume_session",
        "Welcome back! It's been a while since your last message. Reply to this \
         message and we'll pick up where we left off.",
    ),
    (
        "system_error",
        "Something went wrong on our side. Please try again in a few minutes, or \
         contact support if it keeps happening.",
    ),
];

const FALLBACK_MESSAGE: &str =
    "Something went wrong on our side. Please try again in a few minutes.";

pub struct MessageTemplates {
    env: Environment<'static>,
}

impl MessageTemplates {
    pub fn load() -> MessageTemplates {
        let mut env = Environment::new();
        for (key, body) in TEMPLATE_TABLE {
            if let Err(err) = env.add_template(key, body) {
                eprintln!("template {key} failed to load: {err}");
            }
        }
        MessageTemplates { env }
    }

    pub fn render(&self, key: &str, ctx: Value) -> String {
        let Ok(template) = self.env.get_template(key) else {
            eprintln!("unknown message template: {key}");
            return FALLBACK_MESSAGE.to_string();
        };
        template.render(ctx).unwrap_or_else(|err| {
            eprintln!("template {key} failed to render: {err}");
            FALLBACK_MESSAGE.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn every_key_renders() {
        let templates = MessageTemplates::load();
        for (key, _) in TEMPLATE_TABLE {
            let rendered = templates.render(
                key,
                context! { name => "Ana", show => "Aurora", support_contact => "help@example.com" },
            );
            assert!(!rendered.is_empty());
            assert_ne!(rendered, FALLBACK_MESSAGE, "template {key} fell back");
        }
    }

    #[test]
    fn binding_confirmed_substitutes_fields() {
        let templates = MessageTemplates::load();
        let rendered = templates.render(
            "binding_confirmed",
            context! { name => "Ana", show => "Aurora" },
        );
        assert!(rendered.contains("Ana"));
        assert!(rendered.contains("Aurora"));
    }

    #[test]
    fn binding_confirmed_tolerates_missing_fields() {
        let templates = MessageTemplates::load();
        let rendered = templates.render("binding_confirmed", context! {});
        assert!(rendered.contains("You're all set!"));
    }

    #[test]
    fn unknown_key_falls_back() {
        let templates = MessageTemplates::load();
        assert_eq!(templates.render("nope", context! {}), FALLBACK_MESSAGE);
    }
}
