//! Input validation, applied before anything is persisted.

use super::types::{LifecycleError, NewServer, Result, SettingsUpdate};
use crate::storage::GameSettings;

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 256;
pub const MAX_PLAYERS: u32 = 32;
pub const MAX_RATE: f64 = 100.0;

fn invalid(msg: impl Into<String>) -> LifecycleError {
    LifecycleError::Validation(msg.into())
}

fn check_text(field: &str, value: &str, max_len: usize, allow_empty: bool) -> Result<()> {
    if !allow_empty && value.trim().is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    if value.chars().count() > max_len {
        return Err(invalid(format!("{field} exceeds {max_len} characters")));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid(format!("{field} contains control characters")));
    }
    Ok(())
}

fn check_max_players(value: u32) -> Result<()> {
    if (1..=MAX_PLAYERS).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!(
            "max_players must be between 1 and {MAX_PLAYERS}, got {value}"
        )))
    }
}

fn check_rate(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 && value <= MAX_RATE {
        Ok(())
    } else {
        Err(invalid(format!(
            "{field} must be in (0, {MAX_RATE}], got {value}"
        )))
    }
}

fn check_secret(value: &str) -> Result<()> {
    check_text("admin_secret", value, MAX_NAME_LEN, false)?;
    if value.chars().any(char::is_whitespace) {
        return Err(invalid("admin_secret must not contain whitespace"));
    }
    Ok(())
}

fn check_settings(settings: &GameSettings) -> Result<()> {
    check_text("name", &settings.name, MAX_NAME_LEN, false)?;
    check_text("password", &settings.password, MAX_NAME_LEN, true)?;
    check_text(
        "description",
        &settings.description,
        MAX_DESCRIPTION_LEN,
        true,
    )?;
    check_max_players(settings.max_players)?;
    check_rate("exp_rate", settings.exp_rate)?;
    check_rate("capture_rate", settings.capture_rate)?;
    check_rate("spawn_rate", settings.spawn_rate)
}

pub fn validate_new_server(req: &NewServer) -> Result<()> {
    check_settings(&req.settings())?;
    if let Some(secret) = &req.admin_secret {
        check_secret(secret)?;
    }
    Ok(())
}

/// Validate only the fields the update provides.
pub fn validate_update(update: &SettingsUpdate) -> Result<()> {
    if update.is_empty() {
        return Err(invalid("no settings provided"));
    }
    if let Some(name) = &update.name {
        check_text("name", name, MAX_NAME_LEN, false)?;
    }
    if let Some(password) = &update.password {
        check_text("password", password, MAX_NAME_LEN, true)?;
    }
    if let Some(description) = &update.description {
        check_text("description", description, MAX_DESCRIPTION_LEN, true)?;
    }
    if let Some(max_players) = update.max_players {
        check_max_players(max_players)?;
    }
    if let Some(rate) = update.exp_rate {
        check_rate("exp_rate", rate)?;
    }
    if let Some(rate) = update.capture_rate {
        check_rate("capture_rate", rate)?;
    }
    if let Some(rate) = update.spawn_rate {
        check_rate("spawn_rate", rate)?;
    }
    if let Some(secret) = &update.admin_secret {
        check_secret(secret)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_request() {
        assert!(validate_new_server(&NewServer::new("Alpha", "p", 16)).is_ok());
        assert!(validate_new_server(&NewServer::new("Open", "", 1)).is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(validate_new_server(&NewServer::new("  ", "p", 16)).is_err());
        assert!(validate_new_server(&NewServer::new("a\nb", "p", 16)).is_err());
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(validate_new_server(&NewServer::new(long, "p", 16)).is_err());
    }

    #[test]
    fn rejects_player_counts_outside_range() {
        assert!(validate_new_server(&NewServer::new("A", "p", 0)).is_err());
        assert!(validate_new_server(&NewServer::new("A", "p", MAX_PLAYERS + 1)).is_err());
    }

    #[test]
    fn rejects_bad_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY, MAX_RATE + 1.0] {
            let mut req = NewServer::new("A", "p", 8);
            req.exp_rate = rate;
            assert!(validate_new_server(&req).is_err(), "rate {rate}");
        }
    }

    #[test]
    fn update_checks_only_provided_fields() {
        let update = SettingsUpdate {
            exp_rate: Some(2.0),
            ..Default::default()
        };
        assert!(validate_update(&update).is_ok());

        let bad = SettingsUpdate {
            admin_secret: Some("has space".into()),
            ..Default::default()
        };
        assert!(validate_update(&bad).is_err());
        assert!(validate_update(&SettingsUpdate::default()).is_err());
    }
}
