//! Navigation decisions for role-gated screens.

use super::{Role, SessionState};

/// Route shown to signed-out users.
pub const LOGIN_ROUTE: &str = "/(auth)/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Session not settled yet: render nothing and do not navigate.
    Wait,
    Allow,
    RedirectToLogin,
    /// Signed in under another role; go to that role's landing screen.
    RedirectToRoleHome(Role),
}

impl GuardDecision {
    /// Route to navigate to, if any.
    pub fn target(&self) -> Option<&'static str> {
        match self {
            GuardDecision::Wait | GuardDecision::Allow => None,
            GuardDecision::RedirectToLogin => Some(LOGIN_ROUTE),
            GuardDecision::RedirectToRoleHome(role) => Some(role.home_route()),
        }
    }
}

/// Decide what a screen requiring `required_role` should do in `state`.
///
/// `None` means any signed-in user may pass.
pub fn decide(state: &SessionState, required_role: Option<Role>) -> GuardDecision {
    match state {
        SessionState::Unknown => GuardDecision::Wait,
        SessionState::Anonymous => GuardDecision::RedirectToLogin,
        SessionState::Authenticated(identity) => match required_role {
            Some(required) if identity.role() != required => {
                GuardDecision::RedirectToRoleHome(identity.role())
            }
            _ => GuardDecision::Allow,
        },
    }
}
