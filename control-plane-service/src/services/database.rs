//! PostgreSQL hierarchy store.
//!
//! One wrapper owns every query. Hierarchy visibility is composed through
//! `tier_visibility_clause` / `org_column_visibility_clause` and nowhere
//! else; handlers never write hierarchy SQL.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::error::ServiceError;
use super::idp::IdpUser;
use crate::models::{
    AuditAction, ConsentGrant, InventoryRecord, OrgRecord, OrgTier, SessionRecord, SystemRecord,
    UserRecord,
};
use crate::rbac::access::RoleAccessRecord;
use crate::utils::pagination::PageParams;

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Filters accepted by the systems listing. Arrays are OR within a filter
/// and AND across filters; `system_key` is an exact match.
#[derive(Debug, Default, Clone)]
pub struct SystemFilters {
    pub name: Option<String>,
    pub system_key: Option<String>,
    pub types: Vec<String>,
    pub created_by: Vec<String>,
    pub versions: Vec<String>,
    pub org_ids: Vec<String>,
    pub statuses: Vec<String>,
}

fn map_insert_error(what: &str) -> impl FnOnce(sqlx::Error) -> ServiceError + '_ {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ServiceError::AlreadyExists(what.to_string())
        }
        _ => ServiceError::Database(e),
    }
}

fn push_in_list(args: &mut Vec<String>, next_param: &mut usize, values: &[String]) -> String {
    let mut placeholders = Vec::with_capacity(values.len());
    for value in values {
        placeholders.push(format!("${}", next_param));
        args.push(value.clone());
        *next_param += 1;
    }
    placeholders.join(", ")
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Visibility clauses ====================

    /// Visibility predicate for a query over a tier table. The returned
    /// fragment references `{prefix}` columns; its parameters are appended
    /// to `args` starting at `next_param`.
    pub(crate) fn tier_visibility_clause(
        actor_role: Option<OrgTier>,
        actor_org: &str,
        target_tier: OrgTier,
        prefix: &str,
        args: &mut Vec<String>,
        next_param: &mut usize,
    ) -> String {
        let Some(role) = actor_role else {
            return "FALSE".to_string();
        };

        let bind = |value: &str, args: &mut Vec<String>, next_param: &mut usize| {
            let placeholder = format!("${}", next_param);
            args.push(value.to_string());
            *next_param += 1;
            placeholder
        };

        match (role, target_tier) {
            (OrgTier::Owner, _) => "TRUE".to_string(),

            (OrgTier::Distributor, OrgTier::Distributor) => {
                let p = bind(actor_org, args, next_param);
                format!("{}.logto_id = {}", prefix, p)
            }
            (OrgTier::Distributor, OrgTier::Reseller) => {
                let p = bind(actor_org, args, next_param);
                format!("{}.custom_data->>'createdBy' = {}", prefix, p)
            }
            (OrgTier::Distributor, OrgTier::Customer) => {
                let direct = bind(actor_org, args, next_param);
                let transitive = bind(actor_org, args, next_param);
                format!(
                    "({pfx}.custom_data->>'createdBy' = {direct} OR \
                     {pfx}.custom_data->>'createdBy' IN (\
                     SELECT r.logto_id FROM resellers r \
                     WHERE r.custom_data->>'createdBy' = {transitive} AND r.deleted_at IS NULL))",
                    pfx = prefix,
                )
            }

            (OrgTier::Reseller, OrgTier::Reseller) => {
                let p = bind(actor_org, args, next_param);
                format!("{}.logto_id = {}", prefix, p)
            }
            (OrgTier::Reseller, OrgTier::Customer) => {
                let p = bind(actor_org, args, next_param);
                format!("{}.custom_data->>'createdBy' = {}", prefix, p)
            }

            (OrgTier::Customer, OrgTier::Customer) => {
                let p = bind(actor_org, args, next_param);
                format!("{}.logto_id = {}", prefix, p)
            }

            _ => "FALSE".to_string(),
        }
    }

    /// Visibility predicate over an organization-id column (users, systems):
    /// the column must name an organization inside the actor's subtree.
    pub(crate) fn org_column_visibility_clause(
        actor_role: Option<OrgTier>,
        actor_org: &str,
        column: &str,
        args: &mut Vec<String>,
        next_param: &mut usize,
    ) -> String {
        let Some(role) = actor_role else {
            return "FALSE".to_string();
        };

        let bind = |value: &str, args: &mut Vec<String>, next_param: &mut usize| {
            let placeholder = format!("${}", next_param);
            args.push(value.to_string());
            *next_param += 1;
            placeholder
        };

        match role {
            OrgTier::Owner => "TRUE".to_string(),
            OrgTier::Distributor => {
                let own = bind(actor_org, args, next_param);
                let resellers = bind(actor_org, args, next_param);
                let direct_customers = bind(actor_org, args, next_param);
                let transitive = bind(actor_org, args, next_param);
                format!(
                    "({col} = {own} OR \
                     {col} IN (SELECT logto_id FROM resellers \
                     WHERE custom_data->>'createdBy' = {resellers} AND deleted_at IS NULL) OR \
                     {col} IN (SELECT c.logto_id FROM customers c \
                     WHERE c.deleted_at IS NULL AND (c.custom_data->>'createdBy' = {direct_customers} OR \
                     c.custom_data->>'createdBy' IN (SELECT r.logto_id FROM resellers r \
                     WHERE r.custom_data->>'createdBy' = {transitive} AND r.deleted_at IS NULL))))",
                    col = column,
                )
            }
            OrgTier::Reseller => {
                let own = bind(actor_org, args, next_param);
                let customers = bind(actor_org, args, next_param);
                format!(
                    "({col} = {own} OR \
                     {col} IN (SELECT logto_id FROM customers \
                     WHERE custom_data->>'createdBy' = {customers} AND deleted_at IS NULL))",
                    col = column,
                )
            }
            OrgTier::Customer => {
                let own = bind(actor_org, args, next_param);
                format!("{} = {}", column, own)
            }
        }
    }

    // ==================== Organization operations ====================

    pub async fn find_org(
        &self,
        tier: OrgTier,
        id: Uuid,
    ) -> Result<Option<OrgRecord>, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!("SELECT * FROM {} WHERE id = $1 AND deleted_at IS NULL", table);
        Ok(sqlx::query_as::<_, OrgRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Lookup that also sees tombstoned rows; the restore path needs it.
    pub async fn find_org_including_deleted(
        &self,
        tier: OrgTier,
        id: Uuid,
    ) -> Result<Option<OrgRecord>, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!("SELECT * FROM {} WHERE id = $1", table);
        Ok(sqlx::query_as::<_, OrgRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_org_by_logto_id(
        &self,
        tier: OrgTier,
        logto_id: &str,
    ) -> Result<Option<OrgRecord>, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!(
            "SELECT * FROM {} WHERE logto_id = $1 AND deleted_at IS NULL",
            table
        );
        Ok(sqlx::query_as::<_, OrgRecord>(&sql)
            .bind(logto_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Resolve an organization id without knowing its tier.
    pub async fn find_org_any_tier(
        &self,
        logto_id: &str,
    ) -> Result<Option<(OrgTier, OrgRecord)>, ServiceError> {
        for tier in [OrgTier::Distributor, OrgTier::Reseller, OrgTier::Customer] {
            if let Some(record) = self.find_org_by_logto_id(tier, logto_id).await? {
                return Ok(Some((tier, record)));
            }
        }
        Ok(None)
    }

    /// Paginated organization listing under the actor's visibility.
    pub async fn list_organizations(
        &self,
        actor_role: Option<OrgTier>,
        actor_org: &str,
        tier: OrgTier,
        params: &PageParams,
    ) -> Result<(Vec<OrgRecord>, i64), ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;

        let mut args: Vec<String> = Vec::new();
        let mut next_param = 1usize;
        let visibility = Self::tier_visibility_clause(
            actor_role,
            actor_org,
            tier,
            "t",
            &mut args,
            &mut next_param,
        );

        let mut where_clause = format!("t.deleted_at IS NULL AND {}", visibility);
        if let Some(search) = params.search.as_deref().filter(|s| !s.is_empty()) {
            where_clause.push_str(&format!(
                " AND (t.name ILIKE ${p} OR t.description ILIKE ${p2})",
                p = next_param,
                p2 = next_param + 1,
            ));
            let pattern = format!("%{}%", search);
            args.push(pattern.clone());
            args.push(pattern);
            next_param += 2;
        }

        let order = params.order_clause(
            &["name", "description", "created_at", "updated_at"],
            "created_at",
            "DESC",
            "t",
        );

        let sql = format!(
            "SELECT t.* FROM {table} t WHERE {where_clause} ORDER BY {order} LIMIT {limit} OFFSET {offset}",
            limit = params.page_size,
            offset = (params.page - 1) * params.page_size,
        );
        let count_sql = format!("SELECT COUNT(*) FROM {table} t WHERE {where_clause}");

        let mut query = sqlx::query_as::<_, OrgRecord>(&sql);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for arg in &args {
            query = query.bind(arg);
            count_query = count_query.bind(arg);
        }

        let items = query.fetch_all(&self.pool).await?;
        let total = count_query.fetch_one(&self.pool).await?;
        Ok((items, total))
    }

    pub async fn insert_org(
        &self,
        tier: OrgTier,
        logto_id: &str,
        name: &str,
        description: Option<&str>,
        custom_data: &serde_json::Value,
    ) -> Result<OrgRecord, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!(
            "INSERT INTO {} (logto_id, name, description, custom_data) \
             VALUES ($1, $2, $3, $4) RETURNING *",
            table
        );
        sqlx::query_as::<_, OrgRecord>(&sql)
            .bind(logto_id)
            .bind(name)
            .bind(description)
            .bind(custom_data)
            .fetch_one(&self.pool)
            .await
            .map_err(map_insert_error("organization"))
    }

    pub async fn update_org(
        &self,
        tier: OrgTier,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        custom_data: &serde_json::Value,
    ) -> Result<OrgRecord, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!(
            "UPDATE {} SET name = COALESCE($2, name), description = COALESCE($3, description), \
             custom_data = $4, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING *",
            table
        );
        sqlx::query_as::<_, OrgRecord>(&sql)
            .bind(id)
            .bind(name)
            .bind(description)
            .bind(custom_data)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_insert_error("organization"))?
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))
    }

    /// Tombstone an organization and cascade to its users inside one
    /// transaction. Returns the number of cascade-deleted users.
    pub async fn soft_delete_org_cascade(
        &self,
        tier: OrgTier,
        org: &OrgRecord,
    ) -> Result<i64, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE {} SET deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
            table
        );
        let updated = sqlx::query(&sql).bind(org.id).execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            return Err(ServiceError::NotFound("organization".to_string()));
        }

        let users = sqlx::query(
            "UPDATE users SET deleted_at = now(), updated_at = now() \
             WHERE organization_id = $1 AND deleted_at IS NULL",
        )
        .bind(&org.logto_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(users.rows_affected() as i64)
    }

    pub async fn restore_org(&self, tier: OrgTier, id: Uuid) -> Result<OrgRecord, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!(
            "UPDATE {} SET deleted_at = NULL, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NOT NULL RETURNING *",
            table
        );
        sqlx::query_as::<_, OrgRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))
    }

    /// Suspend an organization and cascade to its unsuspended users inside
    /// one transaction. Returns the cascade-suspended user count so that
    /// reactivation can restore exactly those subjects.
    pub async fn suspend_org_cascade(
        &self,
        tier: OrgTier,
        org: &OrgRecord,
    ) -> Result<i64, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE {} SET suspended_at = now(), updated_at = now() \
             WHERE id = $1 AND suspended_at IS NULL AND deleted_at IS NULL",
            table
        );
        let updated = sqlx::query(&sql).bind(org.id).execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            return Err(ServiceError::Conflict(
                "organization already suspended".to_string(),
            ));
        }

        let users = sqlx::query(
            "UPDATE users SET suspended_at = now(), suspended_reason = 'cascade', updated_at = now() \
             WHERE organization_id = $1 AND suspended_at IS NULL AND deleted_at IS NULL",
        )
        .bind(&org.logto_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(users.rows_affected() as i64)
    }

    /// Reactivate an organization; only users suspended by the cascade flip
    /// back.
    pub async fn reactivate_org_cascade(
        &self,
        tier: OrgTier,
        org: &OrgRecord,
    ) -> Result<i64, ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE {} SET suspended_at = NULL, updated_at = now() \
             WHERE id = $1 AND suspended_at IS NOT NULL AND deleted_at IS NULL",
            table
        );
        let updated = sqlx::query(&sql).bind(org.id).execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            return Err(ServiceError::Conflict(
                "organization is not suspended".to_string(),
            ));
        }

        let users = sqlx::query(
            "UPDATE users SET suspended_at = NULL, suspended_reason = NULL, updated_at = now() \
             WHERE organization_id = $1 AND suspended_reason = 'cascade' AND deleted_at IS NULL",
        )
        .bind(&org.logto_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(users.rows_affected() as i64)
    }

    pub async fn mark_org_synced(&self, tier: OrgTier, id: Uuid) -> Result<(), ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!(
            "UPDATE {} SET logto_synced_at = now(), logto_sync_error = NULL WHERE id = $1",
            table
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn mark_org_sync_error(
        &self,
        tier: OrgTier,
        id: Uuid,
        error: &str,
    ) -> Result<(), ServiceError> {
        let table = tier
            .table()
            .ok_or_else(|| ServiceError::NotFound("organization".to_string()))?;
        let sql = format!("UPDATE {} SET logto_sync_error = $2 WHERE id = $1", table);
        sqlx::query(&sql)
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== User operations ====================

    pub async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, ServiceError> {
        Ok(
            sqlx::query_as::<_, UserRecord>(
                "SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?,
        )
    }

    pub async fn find_user_by_logto_id(
        &self,
        logto_id: &str,
    ) -> Result<Option<UserRecord>, ServiceError> {
        Ok(sqlx::query_as::<_, UserRecord>(
            "SELECT * FROM users WHERE logto_id = $1 AND deleted_at IS NULL",
        )
        .bind(logto_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Create the local surrogate from the IdP profile at first exchange.
    pub async fn insert_user_from_idp(&self, profile: &IdpUser) -> Result<UserRecord, ServiceError> {
        sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (logto_id, username, email, name, phone, last_login_at) \
             VALUES ($1, $2, $3, $4, $5, now()) RETURNING *",
        )
        .bind(&profile.id)
        .bind(&profile.username)
        .bind(&profile.primary_email)
        .bind(&profile.name)
        .bind(&profile.primary_phone)
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error("user"))
    }

    pub async fn insert_user(
        &self,
        logto_id: &str,
        username: &str,
        email: &str,
        name: Option<&str>,
        phone: Option<&str>,
        user_role_ids: &[String],
        organization_id: &str,
    ) -> Result<UserRecord, ServiceError> {
        sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (logto_id, username, email, name, phone, user_role_ids, organization_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(logto_id)
        .bind(username)
        .bind(email)
        .bind(name)
        .bind(phone)
        .bind(serde_json::json!(user_role_ids))
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error("user"))
    }

    pub async fn touch_last_login(&self, id: Uuid) -> Result<(), ServiceError> {
        sqlx::query("UPDATE users SET last_login_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_user(
        &self,
        id: Uuid,
        email: Option<&str>,
        name: Option<&str>,
        phone: Option<&str>,
        user_role_ids: Option<&[String]>,
        organization_id: Option<&str>,
    ) -> Result<UserRecord, ServiceError> {
        sqlx::query_as::<_, UserRecord>(
            "UPDATE users SET \
             email = COALESCE($2, email), \
             name = COALESCE($3, name), \
             phone = COALESCE($4, phone), \
             user_role_ids = COALESCE($5, user_role_ids), \
             organization_id = COALESCE($6, organization_id), \
             updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING *",
        )
        .bind(id)
        .bind(email)
        .bind(name)
        .bind(phone)
        .bind(user_role_ids.map(|ids| serde_json::json!(ids)))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound("user".to_string()))
    }

    pub async fn soft_delete_user(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE users SET deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("user".to_string()));
        }
        Ok(())
    }

    pub async fn suspend_user(&self, id: Uuid, reason: &str) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE users SET suspended_at = now(), suspended_reason = $2, updated_at = now() \
             WHERE id = $1 AND suspended_at IS NULL AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::Conflict("user already suspended".to_string()));
        }
        Ok(())
    }

    pub async fn reactivate_user(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE users SET suspended_at = NULL, suspended_reason = NULL, updated_at = now() \
             WHERE id = $1 AND suspended_at IS NOT NULL AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::Conflict("user is not suspended".to_string()));
        }
        Ok(())
    }

    /// Paginated user listing under the actor's visibility.
    pub async fn list_users(
        &self,
        actor_role: Option<OrgTier>,
        actor_org: &str,
        params: &PageParams,
    ) -> Result<(Vec<UserRecord>, i64), ServiceError> {
        let mut args: Vec<String> = Vec::new();
        let mut next_param = 1usize;
        let visibility = Self::org_column_visibility_clause(
            actor_role,
            actor_org,
            "u.organization_id",
            &mut args,
            &mut next_param,
        );

        let mut where_clause = format!("u.deleted_at IS NULL AND {}", visibility);
        if let Some(search) = params.search.as_deref().filter(|s| !s.is_empty()) {
            where_clause.push_str(&format!(
                " AND (u.username ILIKE ${p} OR u.email ILIKE ${p2} OR u.name ILIKE ${p3})",
                p = next_param,
                p2 = next_param + 1,
                p3 = next_param + 2,
            ));
            let pattern = format!("%{}%", search);
            args.push(pattern.clone());
            args.push(pattern.clone());
            args.push(pattern);
            next_param += 3;
        }

        let order = params.order_clause(
            &["username", "email", "name", "created_at", "last_login_at"],
            "created_at",
            "DESC",
            "u",
        );

        let sql = format!(
            "SELECT u.* FROM users u WHERE {where_clause} ORDER BY {order} LIMIT {limit} OFFSET {offset}",
            limit = params.page_size,
            offset = (params.page - 1) * params.page_size,
        );
        let count_sql = format!("SELECT COUNT(*) FROM users u WHERE {where_clause}");

        let mut query = sqlx::query_as::<_, UserRecord>(&sql);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for arg in &args {
            query = query.bind(arg);
            count_query = count_query.bind(arg);
        }

        let items = query.fetch_all(&self.pool).await?;
        let total = count_query.fetch_one(&self.pool).await?;
        Ok((items, total))
    }

    pub async fn distinct_user_organizations(
        &self,
        actor_role: Option<OrgTier>,
        actor_org: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let mut args: Vec<String> = Vec::new();
        let mut next_param = 1usize;
        let visibility = Self::org_column_visibility_clause(
            actor_role,
            actor_org,
            "u.organization_id",
            &mut args,
            &mut next_param,
        );
        let sql = format!(
            "SELECT DISTINCT u.organization_id FROM users u \
             WHERE u.deleted_at IS NULL AND u.organization_id IS NOT NULL AND {visibility} \
             ORDER BY u.organization_id"
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for arg in &args {
            query = query.bind(arg);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn distinct_user_role_ids(
        &self,
        actor_role: Option<OrgTier>,
        actor_org: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let mut args: Vec<String> = Vec::new();
        let mut next_param = 1usize;
        let visibility = Self::org_column_visibility_clause(
            actor_role,
            actor_org,
            "u.organization_id",
            &mut args,
            &mut next_param,
        );
        let sql = format!(
            "SELECT DISTINCT jsonb_array_elements_text(u.user_role_ids) AS role_id \
             FROM users u WHERE u.deleted_at IS NULL AND {visibility} ORDER BY role_id"
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for arg in &args {
            query = query.bind(arg);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    // ==================== System operations ====================

    pub async fn find_system(&self, id: Uuid) -> Result<Option<SystemRecord>, ServiceError> {
        Ok(sqlx::query_as::<_, SystemRecord>(
            "SELECT * FROM systems WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_system_by_key(
        &self,
        system_key: &str,
    ) -> Result<Option<SystemRecord>, ServiceError> {
        Ok(sqlx::query_as::<_, SystemRecord>(
            "SELECT * FROM systems WHERE system_key = $1 AND deleted_at IS NULL",
        )
        .bind(system_key)
        .fetch_optional(&self.pool)
        .await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_system(
        &self,
        name: &str,
        system_type: &str,
        version: Option<&str>,
        system_key: &str,
        secret_hash: &str,
        organization_id: Option<&str>,
        custom_data: &serde_json::Value,
        created_by: &serde_json::Value,
    ) -> Result<SystemRecord, ServiceError> {
        sqlx::query_as::<_, SystemRecord>(
            "INSERT INTO systems (name, type, version, system_key, secret_hash, organization_id, custom_data, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(name)
        .bind(system_type)
        .bind(version)
        .bind(system_key)
        .bind(secret_hash)
        .bind(organization_id)
        .bind(custom_data)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error("system"))
    }

    pub async fn update_system(
        &self,
        id: Uuid,
        name: Option<&str>,
        version: Option<&str>,
        organization_id: Option<&str>,
        custom_data: Option<&serde_json::Value>,
    ) -> Result<SystemRecord, ServiceError> {
        sqlx::query_as::<_, SystemRecord>(
            "UPDATE systems SET \
             name = COALESCE($2, name), \
             version = COALESCE($3, version), \
             organization_id = COALESCE($4, organization_id), \
             custom_data = COALESCE($5, custom_data), \
             updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING *",
        )
        .bind(id)
        .bind(name)
        .bind(version)
        .bind(organization_id)
        .bind(custom_data)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound("system".to_string()))
    }

    pub async fn update_system_secret(
        &self,
        id: Uuid,
        secret_hash: &str,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE systems SET secret_hash = $2, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(secret_hash)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("system".to_string()));
        }
        Ok(())
    }

    pub async fn record_heartbeat(&self, system_key: &str) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE systems SET heartbeat_at = now(), status = 'online', updated_at = now() \
             WHERE system_key = $1 AND deleted_at IS NULL",
        )
        .bind(system_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("system".to_string()));
        }
        Ok(())
    }

    pub async fn soft_delete_system(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE systems SET deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("system".to_string()));
        }
        Ok(())
    }

    pub async fn suspend_system(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE systems SET suspended_at = now(), updated_at = now() \
             WHERE id = $1 AND suspended_at IS NULL AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::Conflict(
                "system already suspended".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn reactivate_system(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE systems SET suspended_at = NULL, updated_at = now() \
             WHERE id = $1 AND suspended_at IS NOT NULL AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::Conflict("system is not suspended".to_string()));
        }
        Ok(())
    }

    /// Paginated system listing under the actor's visibility, with the
    /// documented filter semantics: OR within an array filter, AND across
    /// filters, exact match on `system_key`.
    pub async fn list_systems(
        &self,
        actor_role: Option<OrgTier>,
        actor_org: &str,
        params: &PageParams,
        filters: &SystemFilters,
    ) -> Result<(Vec<SystemRecord>, i64), ServiceError> {
        let mut args: Vec<String> = Vec::new();
        let mut next_param = 1usize;
        let visibility = Self::org_column_visibility_clause(
            actor_role,
            actor_org,
            "s.organization_id",
            &mut args,
            &mut next_param,
        );

        let mut where_clause = format!("s.deleted_at IS NULL AND {}", visibility);

        if let Some(search) = params.search.as_deref().filter(|s| !s.is_empty()) {
            where_clause.push_str(&format!(" AND s.name ILIKE ${}", next_param));
            args.push(format!("%{}%", search));
            next_param += 1;
        }
        if let Some(name) = filters.name.as_deref().filter(|s| !s.is_empty()) {
            where_clause.push_str(&format!(" AND s.name ILIKE ${}", next_param));
            args.push(format!("%{}%", name));
            next_param += 1;
        }
        if let Some(key) = filters.system_key.as_deref().filter(|s| !s.is_empty()) {
            where_clause.push_str(&format!(" AND s.system_key = ${}", next_param));
            args.push(key.to_string());
            next_param += 1;
        }
        if !filters.types.is_empty() {
            let list = push_in_list(&mut args, &mut next_param, &filters.types);
            where_clause.push_str(&format!(" AND s.type IN ({})", list));
        }
        if !filters.created_by.is_empty() {
            let list = push_in_list(&mut args, &mut next_param, &filters.created_by);
            where_clause.push_str(&format!(" AND s.created_by->>'user_id' IN ({})", list));
        }
        if !filters.versions.is_empty() {
            let list = push_in_list(&mut args, &mut next_param, &filters.versions);
            where_clause.push_str(&format!(" AND s.version IN ({})", list));
        }
        if !filters.org_ids.is_empty() {
            let list = push_in_list(&mut args, &mut next_param, &filters.org_ids);
            where_clause.push_str(&format!(" AND s.organization_id IN ({})", list));
        }
        if !filters.statuses.is_empty() {
            let list = push_in_list(&mut args, &mut next_param, &filters.statuses);
            where_clause.push_str(&format!(" AND s.status IN ({})", list));
        }

        let order = params.order_clause(
            &["name", "type", "version", "status", "created_at", "heartbeat_at"],
            "created_at",
            "DESC",
            "s",
        );

        let sql = format!(
            "SELECT s.* FROM systems s WHERE {where_clause} ORDER BY {order} LIMIT {limit} OFFSET {offset}",
            limit = params.page_size,
            offset = (params.page - 1) * params.page_size,
        );
        let count_sql = format!("SELECT COUNT(*) FROM systems s WHERE {where_clause}");

        let mut query = sqlx::query_as::<_, SystemRecord>(&sql);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for arg in &args {
            query = query.bind(arg);
            count_query = count_query.bind(arg);
        }

        let items = query.fetch_all(&self.pool).await?;
        let total = count_query.fetch_one(&self.pool).await?;
        Ok((items, total))
    }

    pub async fn distinct_system_column(
        &self,
        actor_role: Option<OrgTier>,
        actor_org: &str,
        column: &str,
    ) -> Result<Vec<String>, ServiceError> {
        // Allow-listed columns only; this is not a user-supplied value.
        debug_assert!(matches!(
            column,
            "type" | "version" | "status" | "organization_id"
        ));
        let mut args: Vec<String> = Vec::new();
        let mut next_param = 1usize;
        let visibility = Self::org_column_visibility_clause(
            actor_role,
            actor_org,
            "s.organization_id",
            &mut args,
            &mut next_param,
        );
        let sql = format!(
            "SELECT DISTINCT s.{column} FROM systems s \
             WHERE s.deleted_at IS NULL AND s.{column} IS NOT NULL AND {visibility} \
             ORDER BY s.{column}"
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for arg in &args {
            query = query.bind(arg);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn insert_inventory(
        &self,
        system_id: Uuid,
        data: &serde_json::Value,
    ) -> Result<(), ServiceError> {
        sqlx::query("INSERT INTO system_inventory (system_id, data) VALUES ($1, $2)")
            .bind(system_id)
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_inventory(
        &self,
        system_id: Uuid,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<InventoryRecord>, i64), ServiceError> {
        let items = sqlx::query_as::<_, InventoryRecord>(
            "SELECT * FROM system_inventory WHERE system_id = $1 \
             ORDER BY recorded_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(system_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&self.pool)
        .await?;
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM system_inventory WHERE system_id = $1",
        )
        .bind(system_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((items, total))
    }

    // ==================== Impersonation operations ====================

    /// Upsert the single consent row for a grantor; a fresh consent replaces
    /// any prior one.
    pub async fn upsert_consent(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
        duration_hours: i32,
    ) -> Result<ConsentGrant, ServiceError> {
        Ok(sqlx::query_as::<_, ConsentGrant>(
            "INSERT INTO impersonation_consents (user_id, issued_at, expires_at, duration_hours) \
             VALUES ($1, now(), $2, $3) \
             ON CONFLICT (user_id) DO UPDATE \
             SET issued_at = now(), expires_at = $2, duration_hours = $3 \
             RETURNING *",
        )
        .bind(user_id)
        .bind(expires_at)
        .bind(duration_hours)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn get_consent(&self, user_id: &str) -> Result<Option<ConsentGrant>, ServiceError> {
        Ok(sqlx::query_as::<_, ConsentGrant>(
            "SELECT * FROM impersonation_consents WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Idempotent consent removal.
    pub async fn delete_consent(&self, user_id: &str) -> Result<(), ServiceError> {
        sqlx::query("DELETE FROM impersonation_consents WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_session(&self, session: &SessionRecord) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO impersonation_sessions (session_id, impersonator_id, impersonated_id, started_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&session.session_id)
        .bind(&session.impersonator_id)
        .bind(&session.impersonated_id)
        .bind(session.started_at)
        .execute(&self.pool)
        .await
        .map_err(map_insert_error("impersonation session"))?;
        Ok(())
    }

    pub async fn end_session(&self, session_id: &str) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE impersonation_sessions SET ended_at = now() \
             WHERE session_id = $1 AND ended_at IS NULL",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, ServiceError> {
        Ok(sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM impersonation_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Paginated session history, optionally scoped to one impersonator.
    pub async fn list_sessions(
        &self,
        impersonator_id: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<SessionRecord>, i64), ServiceError> {
        let (items, total) = match impersonator_id {
            Some(impersonator) => {
                let items = sqlx::query_as::<_, SessionRecord>(
                    "SELECT * FROM impersonation_sessions WHERE impersonator_id = $1 \
                     ORDER BY started_at DESC LIMIT $2 OFFSET $3",
                )
                .bind(impersonator)
                .bind(page_size)
                .bind((page - 1) * page_size)
                .fetch_all(&self.pool)
                .await?;
                let total = sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM impersonation_sessions WHERE impersonator_id = $1",
                )
                .bind(impersonator)
                .fetch_one(&self.pool)
                .await?;
                (items, total)
            }
            None => {
                let items = sqlx::query_as::<_, SessionRecord>(
                    "SELECT * FROM impersonation_sessions \
                     ORDER BY started_at DESC LIMIT $1 OFFSET $2",
                )
                .bind(page_size)
                .bind((page - 1) * page_size)
                .fetch_all(&self.pool)
                .await?;
                let total =
                    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM impersonation_sessions")
                        .fetch_one(&self.pool)
                        .await?;
                (items, total)
            }
        };
        Ok((items, total))
    }

    /// Append-only audit insert.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_audit(
        &self,
        session_id: &str,
        action: AuditAction,
        impersonator_id: &str,
        impersonator_username: &str,
        impersonated_id: &str,
        impersonated_username: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO impersonation_audit \
             (session_id, action, impersonator_id, impersonator_username, impersonated_id, impersonated_username, details) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(session_id)
        .bind(action.as_str())
        .bind(impersonator_id)
        .bind(impersonator_username)
        .bind(impersonated_id)
        .bind(impersonated_username)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_audit(
        &self,
        session_id: &str,
    ) -> Result<Vec<crate::models::AuditEntry>, ServiceError> {
        Ok(sqlx::query_as::<_, crate::models::AuditEntry>(
            "SELECT * FROM impersonation_audit WHERE session_id = $1 ORDER BY at, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ==================== Role access control ====================

    pub async fn get_role_access_control(
        &self,
        role_id: &str,
    ) -> Result<Option<RoleAccessRecord>, ServiceError> {
        Ok(sqlx::query_as::<_, RoleAccessRecord>(
            "SELECT has_access_control, required_org_role FROM role_access_controls WHERE role_id = $1",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_sees_everything() {
        let mut args = Vec::new();
        let mut next = 1;
        let clause = Database::tier_visibility_clause(
            Some(OrgTier::Owner),
            "org-owner",
            OrgTier::Customer,
            "t",
            &mut args,
            &mut next,
        );
        assert_eq!(clause, "TRUE");
        assert!(args.is_empty());
    }

    #[test]
    fn unknown_role_sees_nothing() {
        let mut args = Vec::new();
        let mut next = 1;
        let clause = Database::tier_visibility_clause(
            None,
            "org-x",
            OrgTier::Customer,
            "t",
            &mut args,
            &mut next,
        );
        assert_eq!(clause, "FALSE");
    }

    #[test]
    fn reseller_customer_clause_binds_actor_org() {
        let mut args = Vec::new();
        let mut next = 1;
        let clause = Database::tier_visibility_clause(
            Some(OrgTier::Reseller),
            "org-r1",
            OrgTier::Customer,
            "t",
            &mut args,
            &mut next,
        );
        assert_eq!(clause, "t.custom_data->>'createdBy' = $1");
        assert_eq!(args, vec!["org-r1".to_string()]);
        assert_eq!(next, 2);
    }

    #[test]
    fn distributor_customer_clause_is_transitive() {
        let mut args = Vec::new();
        let mut next = 1;
        let clause = Database::tier_visibility_clause(
            Some(OrgTier::Distributor),
            "org-d1",
            OrgTier::Customer,
            "c",
            &mut args,
            &mut next,
        );
        assert!(clause.contains("c.custom_data->>'createdBy' = $1"));
        assert!(clause.contains("SELECT r.logto_id FROM resellers r"));
        assert!(clause.contains("$2"));
        assert_eq!(args.len(), 2);
        assert_eq!(next, 3);
    }

    #[test]
    fn distributor_cannot_see_other_distributors() {
        let mut args = Vec::new();
        let mut next = 1;
        let clause = Database::tier_visibility_clause(
            Some(OrgTier::Distributor),
            "org-d1",
            OrgTier::Distributor,
            "t",
            &mut args,
            &mut next,
        );
        assert_eq!(clause, "t.logto_id = $1");
    }

    #[test]
    fn customer_sees_only_self_by_column() {
        let mut args = Vec::new();
        let mut next = 1;
        let clause = Database::org_column_visibility_clause(
            Some(OrgTier::Customer),
            "org-c1",
            "u.organization_id",
            &mut args,
            &mut next,
        );
        assert_eq!(clause, "u.organization_id = $1");
        assert_eq!(args, vec!["org-c1".to_string()]);
    }

    #[test]
    fn clause_respects_start_param_index() {
        let mut args = vec!["preexisting".to_string()];
        let mut next = 2;
        let clause = Database::tier_visibility_clause(
            Some(OrgTier::Reseller),
            "org-r1",
            OrgTier::Customer,
            "t",
            &mut args,
            &mut next,
        );
        assert_eq!(clause, "t.custom_data->>'createdBy' = $2");
        assert_eq!(next, 3);
    }

    #[test]
    fn in_list_allocates_sequential_params() {
        let mut args = Vec::new();
        let mut next = 1;
        let list = push_in_list(
            &mut args,
            &mut next,
            &["a".to_string(), "b".to_string(), "c".to_string()],
        );
        assert_eq!(list, "$1, $2, $3");
        assert_eq!(next, 4);
        assert_eq!(args.len(), 3);
    }
}
