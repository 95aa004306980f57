//! Pagination and sort parameter handling.

use serde::Deserialize;

/// Raw query-string pagination parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_direction: Option<String>,
}

/// Normalized pagination parameters.
#[derive(Debug, Clone)]
pub struct PageParams {
    pub page: i64,
    pub page_size: i64,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_direction: Option<String>,
}

impl PageParams {
    pub fn from_query(query: &PageQuery, default_page_size: i64, max_page_size: i64) -> Self {
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query
            .page_size
            .unwrap_or(default_page_size)
            .clamp(1, max_page_size);
        Self {
            page,
            page_size,
            search: query.search.clone(),
            sort_by: query.sort_by.clone(),
            sort_direction: query.sort_direction.clone(),
        }
    }

    /// Compose an ORDER BY fragment from an allow-listed column; anything
    /// off the list falls back to the default.
    pub fn order_clause(
        &self,
        allowed: &[&str],
        default_column: &str,
        default_direction: &str,
        prefix: &str,
    ) -> String {
        let column = self
            .sort_by
            .as_deref()
            .filter(|c| allowed.contains(c))
            .unwrap_or(default_column);
        let direction = match self.sort_direction.as_deref() {
            Some(d) if d.eq_ignore_ascii_case("asc") => "ASC",
            Some(d) if d.eq_ignore_ascii_case("desc") => "DESC",
            _ => default_direction,
        };
        format!("{}.{} {}", prefix, column, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_defaults_and_clamps() {
        let params = PageParams::from_query(&PageQuery::default(), 20, 100);
        assert_eq!(params.page, 1);
        assert_eq!(params.page_size, 20);

        let params = PageParams::from_query(
            &PageQuery {
                page: Some(0),
                page_size: Some(500),
                ..PageQuery::default()
            },
            20,
            100,
        );
        assert_eq!(params.page, 1);
        assert_eq!(params.page_size, 100);
    }

    #[test]
    fn order_clause_allow_lists_columns() {
        let params = PageParams {
            page: 1,
            page_size: 20,
            search: None,
            sort_by: Some("name".to_string()),
            sort_direction: Some("asc".to_string()),
        };
        assert_eq!(
            params.order_clause(&["name", "created_at"], "created_at", "DESC", "t"),
            "t.name ASC"
        );
    }

    #[test]
    fn order_clause_rejects_unlisted_column() {
        let params = PageParams {
            page: 1,
            page_size: 20,
            search: None,
            sort_by: Some("secret_hash; DROP TABLE users".to_string()),
            sort_direction: None,
        };
        assert_eq!(
            params.order_clause(&["name", "created_at"], "created_at", "DESC", "t"),
            "t.created_at DESC"
        );
    }
}
