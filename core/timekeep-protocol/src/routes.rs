//! Remote API routes, relative to the configured base URL.

pub const AUTH_LOGIN: &str = "/api/auth/login";
pub const AUTH_REFRESH: &str = "/api/auth/refresh";
pub const AUTH_LOGOUT: &str = "/api/auth/logout";

pub const TIME_ENTRIES: &str = "/api/time-entries";
pub const TIME_ENTRIES_START: &str = "/api/time-entries/start";
pub const TIME_ENTRIES_STOP: &str = "/api/time-entries/stop";
pub const TIME_ENTRIES_CURRENT: &str = "/api/time-entries/current";

pub const SCREENSHOTS: &str = "/api/screenshots";

pub const PROJECTS: &str = "/api/projects";
pub const TASKS: &str = "/api/tasks";
pub const CLIENTS: &str = "/api/clients";
pub const SETTINGS: &str = "/api/settings";

pub const SYNC_STATUS: &str = "/api/sync/status";
pub const SYNC_TRIGGER: &str = "/api/sync/trigger";

pub const ORGANIZATIONS: &str = "/api/organizations";

/// Item route under a collection, e.g. `/api/projects/42`.
pub fn item(collection: &str, id: &str) -> String {
    format!("{}/{}", collection.trim_end_matches('/'), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_route_joins_without_double_slash() {
        assert_eq!(item("/api/projects/", "7"), "/api/projects/7");
        assert_eq!(item(CLIENTS, "c1"), "/api/clients/c1");
    }
}
