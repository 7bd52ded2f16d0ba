// Subjects are dot separated tokens. Subscriptions may use
// `*` for exactly one token and `>` for one or more trailing tokens.

const PWC: &str = "*";
const FWC: &str = ">";

fn tokens(subject: &str) -> impl Iterator<Item = &str> {
    subject.split('.')
}

fn valid_token(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(char::is_whitespace)
}

/// A subject a message can be published to: no wildcards.
pub(crate) fn is_valid_publish_subject(subject: &str) -> bool {
    !subject.is_empty() && tokens(subject).all(|t| valid_token(t) && t != PWC && t != FWC)
}

/// A subject a client can subscribe to. `>` may only be the last token.
pub(crate) fn is_valid_subscription(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let mut toks = tokens(subject).peekable();
    while let Some(tok) = toks.next() {
        if !valid_token(tok) {
            return false;
        }
        if tok == FWC && toks.peek().is_some() {
            return false;
        }
    }
    true
}

/// Queue group names are a single token without whitespace.
pub(crate) fn is_valid_queue(queue: &str) -> bool {
    valid_token(queue)
}

/// Returns true if the literal `subject` is matched by `pattern`.
pub(crate) fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = tokens(pattern);
    let mut sub = tokens(subject);
    loop {
        match (pat.next(), sub.next()) {
            (Some(FWC), Some(_)) => return true,
            (Some(PWC), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
