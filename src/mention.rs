use std::sync::Arc;

use log::debug;

use crate::error::ChatResult;
use crate::models::chat::{Conversation, Participant, UserProfile};
use crate::store::UserDirectory;

/// The token that addresses the AI agent directly. Never treated as a user
/// mention.
pub const AGENT_MENTION: &str = "@@";

const SEARCH_LIMIT: usize = 10;

/// Extracts `@name` tokens from message text. Allowed name characters are
/// letters, digits, `_`, `.` and `-`. Tokens are deduplicated
/// case-insensitively, keeping first-seen casing and order. `@@` is skipped.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let bytes: Vec<char> = text.chars().collect();
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != '@' {
            i += 1;
            continue;
        }
        if i + 1 < bytes.len() && bytes[i + 1] == '@' {
            i += 2;
            continue;
        }

        let mut j = i + 1;
        while j < bytes.len() {
            let ch = bytes[j];
            if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                j += 1;
            } else {
                break;
            }
        }

        if j > i + 1 {
            let token: String = bytes[i + 1..j].iter().collect();
            let lower = token.to_lowercase();
            if !seen.contains(&lower) {
                seen.push(lower);
                out.push(token);
            }
        }
        i = j.max(i + 1);
    }

    out
}

/// Synthesizes a group name from the first three distinct participant display
/// names, with a trailing "+" marker when more exist. Only used when no
/// explicit name was set.
pub fn build_group_name(participants: &[Participant]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for p in participants {
        let name = p.display_name.trim();
        if name.is_empty() || names.contains(&name) {
            continue;
        }
        names.push(name);
    }

    if names.is_empty() {
        return "Group Chat".to_string();
    }

    let shown = names.len().min(3);
    let mut base = names[..shown].join(", ");
    if names.len() > shown {
        base.push_str(" +");
    }
    base
}

/// Resolves @mentions in message text against the user directory.
pub struct MentionResolver {
    directory: Arc<dyn UserDirectory>,
}

impl MentionResolver {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// Returns the mentioned users that are not yet participants of the
    /// conversation, deduplicated by id. Unresolvable tokens are skipped.
    ///
    /// Resolution per token: exact case-insensitive match on display name,
    /// handle or email local-part among the directory search results; failing
    /// that, the closest fuzzy candidate by Jaro-Winkler similarity.
    pub async fn resolve_new_participants(
        &self,
        conversation: &Conversation,
        sender_id: &str,
        text: &str,
    ) -> ChatResult<Vec<UserProfile>> {
        let tokens = extract_mentions(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut added: Vec<UserProfile> = Vec::new();
        for token in tokens {
            let candidates = self.directory.search(&token, sender_id, SEARCH_LIMIT).await?;
            let resolved = match find_exact(&candidates, &token) {
                Some(user) => Some(user),
                None => find_fuzzy(&candidates, &token),
            };

            let user = match resolved {
                Some(u) => u.clone(),
                None => {
                    debug!("mention '@{}' did not resolve to any user", token);
                    continue;
                }
            };

            if conversation.is_participant(&user.id) {
                continue;
            }
            if added.iter().any(|u| u.id == user.id) {
                continue;
            }
            added.push(user);
        }

        Ok(added)
    }
}

fn find_exact<'a>(candidates: &'a [UserProfile], token: &str) -> Option<&'a UserProfile> {
    candidates.iter().find(|u| {
        u.display_name.eq_ignore_ascii_case(token)
            || u.handle.eq_ignore_ascii_case(token)
            || email_local_part(&u.email).eq_ignore_ascii_case(token)
    })
}

fn find_fuzzy<'a>(candidates: &'a [UserProfile], token: &str) -> Option<&'a UserProfile> {
    let needle = token.to_lowercase();
    candidates.iter().max_by(|a, b| {
        let sa = strsim::jaro_winkler(&needle, &a.handle.to_lowercase());
        let sb = strsim::jaro_winkler(&needle, &b.handle.to_lowercase());
        sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn email_local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}
