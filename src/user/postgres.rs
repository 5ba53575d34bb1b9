//! PostgreSQL implementation of [`UserRepository`].

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

use crate::user::repository::Result;
use crate::user::{
    Field, Profile, Projection, StoreError, User, UserRepository,
};

/// User row as read back. Columns left out of the `SELECT` stay `None`.
#[derive(Debug, Clone, FromRow)]
struct UserRecord {
    id: String,
    #[sqlx(default)]
    username: Option<String>,
    #[sqlx(default)]
    email: Option<String>,
    #[sqlx(default)]
    first_name: Option<String>,
    #[sqlx(default)]
    last_name: Option<String>,
    #[sqlx(default)]
    address: Option<String>,
    #[sqlx(default)]
    phone: Option<String>,
    #[sqlx(default)]
    semester: Option<String>,
    #[sqlx(default)]
    parallel: Option<String>,
    #[sqlx(default)]
    career: Option<String>,
    #[sqlx(default)]
    description: Option<String>,
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        User {
            id: record.id,
            profile: Profile {
                username: record.username,
                email: record.email,
                first_name: record.first_name,
                last_name: record.last_name,
                address: record.address,
                phone: record.phone,
                semester: record.semester,
                parallel: record.parallel,
                career: record.career,
                description: record.description,
                image: None,
            },
        }
    }
}

fn column(field: Field) -> &'static str {
    match field {
        Field::Username => "username",
        Field::Email => "email",
        Field::FirstName => "first_name",
        Field::LastName => "last_name",
        Field::Address => "address",
        Field::Phone => "phone",
        Field::Semester => "semester",
        Field::Parallel => "parallel",
        Field::Career => "career",
        Field::Description => "description",
    }
}

/// `id` followed by the projected columns. Image columns are never read.
fn select_list(projection: &Projection) -> String {
    std::iter::once("id")
        .chain(projection.fields().iter().map(|field| column(*field)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// PostgreSQL user repository.
#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    /// Create a new [`PgUserRepository`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Bind `id` then every profile column, from `$1` to `$13`.
fn bind_profile<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    id: &'q str,
    profile: &'q Profile,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(id)
        .bind(&profile.username)
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.address)
        .bind(&profile.phone)
        .bind(&profile.semester)
        .bind(&profile.parallel)
        .bind(&profile.career)
        .bind(&profile.description)
        .bind(profile.image.as_ref().map(|i| i.data.as_slice()))
        .bind(profile.image.as_ref().map(|i| i.content_type.as_str()))
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, id: &str) -> Result<User> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            select_list(&Projection::default())
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        record.map(User::from).ok_or(StoreError::NotFound)
    }

    async fn find_all(&self, projection: &Projection) -> Result<Vec<User>> {
        let records = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users ORDER BY id",
            select_list(projection)
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(User::from).collect())
    }

    async fn upsert(&self, id: &str, profile: &Profile) -> Result<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO users (
                id, username, email, first_name, last_name, address, phone,
                semester, parallel, career, description, image_data, image_content_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                username = COALESCE(EXCLUDED.username, users.username),
                email = COALESCE(EXCLUDED.email, users.email),
                first_name = COALESCE(EXCLUDED.first_name, users.first_name),
                last_name = COALESCE(EXCLUDED.last_name, users.last_name),
                address = COALESCE(EXCLUDED.address, users.address),
                phone = COALESCE(EXCLUDED.phone, users.phone),
                semester = COALESCE(EXCLUDED.semester, users.semester),
                parallel = COALESCE(EXCLUDED.parallel, users.parallel),
                career = COALESCE(EXCLUDED.career, users.career),
                description = COALESCE(EXCLUDED.description, users.description),
                image_data = COALESCE(EXCLUDED.image_data, users.image_data),
                image_content_type = COALESCE(EXCLUDED.image_content_type, users.image_content_type),
                updated_at = NOW()
            "#,
        );

        bind_profile(query, id, profile).execute(&self.pool).await?;

        Ok(())
    }

    async fn update(&self, id: &str, profile: &Profile) -> Result<bool> {
        let query = sqlx::query(
            r#"
            UPDATE users
            SET
                username = COALESCE($2, username),
                email = COALESCE($3, email),
                first_name = COALESCE($4, first_name),
                last_name = COALESCE($5, last_name),
                address = COALESCE($6, address),
                phone = COALESCE($7, phone),
                semester = COALESCE($8, semester),
                parallel = COALESCE($9, parallel),
                career = COALESCE($10, career),
                description = COALESCE($11, description),
                image_data = COALESCE($12, image_data),
                image_content_type = COALESCE($13, image_content_type),
                updated_at = NOW()
            WHERE id = $1
            "#,
        );

        let result = bind_profile(query, id, profile).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(r#"DELETE FROM users WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
