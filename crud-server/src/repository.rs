//! Repository layer with async trait abstractions and in-memory implementations.
//! Every store is an `InMemoryTable<T>`: an ordered map plus an id counter behind `Arc<RwLock<...>>`.
//! Nothing survives a restart.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::RwLock;

use crate::models::{now, AppError, Article, ArticlePatch, Comment, Id, NewArticle, Post, Todo, TodoPatch, User};

/// Rows stored in an [`InMemoryTable`].
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> Id;
}

impl Record for Todo { fn id(&self) -> Id { self.id } }
impl Record for Comment { fn id(&self) -> Id { self.id } }
impl Record for Article { fn id(&self) -> Id { self.id } }
impl Record for Post { fn id(&self) -> Id { self.id } }
impl Record for User { fn id(&self) -> Id { self.id } }

#[derive(Debug)]
struct Table<T> {
    rows: BTreeMap<Id, T>,
    next_id: Id,
}

impl<T> Default for Table<T> {
    fn default() -> Self { Self { rows: BTreeMap::new(), next_id: 1 } }
}

/// Process-local table with sequential ids. Cloning shares the same rows.
#[derive(Debug)]
pub struct InMemoryTable<T> {
    inner: Arc<RwLock<Table<T>>>,
}

impl<T> Clone for InMemoryTable<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: Record> Default for InMemoryTable<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Record> InMemoryTable<T> {
    pub fn new() -> Self { Self { inner: Arc::new(RwLock::new(Table::default())) } }

    /// Assigns the next id and stores the row built from it.
    pub async fn insert_with<F>(&self, build: F) -> T
    where
        F: FnOnce(Id) -> T + Send,
    {
        let mut table = self.inner.write().await;
        let id = table.next_id;
        table.next_id += 1;
        let row = build(id);
        debug_assert_eq!(row.id(), id, "row built with a foreign id");
        table.rows.insert(id, row.clone());
        row
    }

    /// Like [`insert_with`](Self::insert_with) but returns `None` without consuming an id
    /// when any stored row satisfies `conflicts`. The check and insert happen under one lock.
    pub async fn insert_unless<C, F>(&self, conflicts: C, build: F) -> Option<T>
    where
        C: Fn(&T) -> bool + Send,
        F: FnOnce(Id) -> T + Send,
    {
        let mut table = self.inner.write().await;
        if table.rows.values().any(|row| conflicts(row)) {
            return None;
        }
        let id = table.next_id;
        table.next_id += 1;
        let row = build(id);
        debug_assert_eq!(row.id(), id, "row built with a foreign id");
        table.rows.insert(id, row.clone());
        Some(row)
    }

    pub async fn get(&self, id: Id) -> Option<T> {
        self.inner.read().await.rows.get(&id).cloned()
    }

    /// All rows in id order.
    pub async fn all(&self) -> Vec<T> {
        self.inner.read().await.rows.values().cloned().collect()
    }

    pub async fn filter<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool + Send,
    {
        self.inner.read().await.rows.values().filter(|row| predicate(row)).cloned().collect()
    }

    pub async fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool + Send,
    {
        self.inner.read().await.rows.values().find(|row| predicate(row)).cloned()
    }

    /// Applies `change` in place and returns the updated row.
    pub async fn update_with<F>(&self, id: Id, change: F) -> Option<T>
    where
        F: FnOnce(&mut T) + Send,
    {
        let mut table = self.inner.write().await;
        let row = table.rows.get_mut(&id)?;
        change(row);
        Some(row.clone())
    }

    pub async fn remove(&self, id: Id) -> Option<T> {
        self.inner.write().await.rows.remove(&id)
    }

    /// Drops every row and restarts ids at 1.
    pub async fn clear(&self) {
        *self.inner.write().await = Table::default();
    }

    pub async fn len(&self) -> usize { self.inner.read().await.rows.len() }

    pub async fn is_empty(&self) -> bool { self.len().await == 0 }
}

#[async_trait]
pub trait TodoRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Todo>, AppError>;
    async fn find(&self, id: Id) -> Result<Todo, AppError>;
    async fn create(&self, title: String, completed: bool) -> Result<Todo, AppError>;
    async fn update(&self, id: Id, patch: TodoPatch) -> Result<Todo, AppError>;
    async fn delete(&self, id: Id) -> Result<(), AppError>;
}

#[async_trait]
pub trait CommentRepository: Send + Sync {
    /// Newest first.
    async fn list(&self) -> Result<Vec<Comment>, AppError>;
    async fn find(&self, id: Id) -> Result<Comment, AppError>;
    async fn create(&self, content: String, author: String) -> Result<Comment, AppError>;
    async fn delete(&self, id: Id) -> Result<(), AppError>;
}

#[async_trait]
pub trait ArticleRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Article>, AppError>;
    async fn list_by_user(&self, user_id: Id) -> Result<Vec<Article>, AppError>;
    async fn find(&self, id: Id) -> Result<Article, AppError>;
    async fn create(&self, article: NewArticle) -> Result<Article, AppError>;
    async fn update(&self, id: Id, patch: ArticlePatch) -> Result<Article, AppError>;
    async fn delete(&self, id: Id) -> Result<(), AppError>;
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Post>, AppError>;
    async fn find(&self, id: Id) -> Result<Post, AppError>;
    async fn create(&self, title: String, author: String, content: String) -> Result<Post, AppError>;
    async fn delete(&self, id: Id) -> Result<(), AppError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, username: String, email: String, password_hash: String) -> Result<User, AppError>;
    async fn find_by_id(&self, id: Id) -> Result<User, AppError>;
    async fn find_by_email(&self, email: &str) -> Result<User, AppError>;
    async fn update_password(&self, id: Id, password_hash: String) -> Result<User, AppError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryTodoRepository {
    table: InMemoryTable<Todo>,
}

#[async_trait]
impl TodoRepository for InMemoryTodoRepository {
    async fn list(&self) -> Result<Vec<Todo>, AppError> { Ok(self.table.all().await) }

    async fn find(&self, id: Id) -> Result<Todo, AppError> {
        self.table.get(id).await.ok_or_else(|| AppError::NotFound("Todo not found".into()))
    }

    async fn create(&self, title: String, completed: bool) -> Result<Todo, AppError> {
        Ok(self.table.insert_with(|id| Todo { id, title, completed }).await)
    }

    async fn update(&self, id: Id, patch: TodoPatch) -> Result<Todo, AppError> {
        self.table
            .update_with(id, |todo| {
                if let Some(title) = patch.title { todo.title = title; }
                if let Some(completed) = patch.completed { todo.completed = completed; }
            })
            .await
            .ok_or_else(|| AppError::NotFound("Todo not found".into()))
    }

    async fn delete(&self, id: Id) -> Result<(), AppError> {
        self.table.remove(id).await.ok_or_else(|| AppError::NotFound("Todo not found".into()))?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryCommentRepository {
    table: InMemoryTable<Comment>,
}

#[async_trait]
impl CommentRepository for InMemoryCommentRepository {
    async fn list(&self) -> Result<Vec<Comment>, AppError> {
        let mut comments = self.table.all().await;
        comments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(comments)
    }

    async fn find(&self, id: Id) -> Result<Comment, AppError> {
        self.table.get(id).await.ok_or_else(|| AppError::NotFound("Comment not found".into()))
    }

    async fn create(&self, content: String, author: String) -> Result<Comment, AppError> {
        Ok(self.table.insert_with(|id| Comment { id, content, author, created_at: now() }).await)
    }

    async fn delete(&self, id: Id) -> Result<(), AppError> {
        self.table.remove(id).await.ok_or_else(|| AppError::NotFound("Comment not found".into()))?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryArticleRepository {
    table: InMemoryTable<Article>,
}

#[async_trait]
impl ArticleRepository for InMemoryArticleRepository {
    async fn list(&self) -> Result<Vec<Article>, AppError> { Ok(self.table.all().await) }

    async fn list_by_user(&self, user_id: Id) -> Result<Vec<Article>, AppError> {
        Ok(self.table.filter(|a| a.user_id == user_id).await)
    }

    async fn find(&self, id: Id) -> Result<Article, AppError> {
        self.table.get(id).await.ok_or_else(|| AppError::NotFound("Article not found".into()))
    }

    async fn create(&self, article: NewArticle) -> Result<Article, AppError> {
        let created_at = now();
        Ok(self
            .table
            .insert_with(|id| Article {
                id,
                user_id: article.user_id,
                title: article.title,
                content: article.content,
                published: article.published,
                created_at,
                updated_at: created_at,
            })
            .await)
    }

    async fn update(&self, id: Id, patch: ArticlePatch) -> Result<Article, AppError> {
        self.table
            .update_with(id, |article| {
                if let Some(title) = patch.title { article.title = title; }
                if let Some(content) = patch.content { article.content = content; }
                if let Some(published) = patch.published { article.published = published; }
                // Clock resolution can repeat a timestamp; updated_at must still move forward.
                let stamp = now();
                article.updated_at = if stamp > article.updated_at {
                    stamp
                } else {
                    article.updated_at + Duration::milliseconds(1)
                };
            })
            .await
            .ok_or_else(|| AppError::NotFound("Article not found".into()))
    }

    async fn delete(&self, id: Id) -> Result<(), AppError> {
        self.table.remove(id).await.ok_or_else(|| AppError::NotFound("Article not found".into()))?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryPostRepository {
    table: InMemoryTable<Post>,
}

#[async_trait]
impl PostRepository for InMemoryPostRepository {
    async fn list(&self) -> Result<Vec<Post>, AppError> { Ok(self.table.all().await) }

    async fn find(&self, id: Id) -> Result<Post, AppError> {
        self.table.get(id).await.ok_or_else(|| AppError::NotFound("Post not found".into()))
    }

    async fn create(&self, title: String, author: String, content: String) -> Result<Post, AppError> {
        Ok(self.table.insert_with(|id| Post { id, title, author, content, created_at: now() }).await)
    }

    async fn delete(&self, id: Id) -> Result<(), AppError> {
        self.table.remove(id).await.ok_or_else(|| AppError::NotFound("Post not found".into()))?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryUserRepository {
    table: InMemoryTable<User>,
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, username: String, email: String, password_hash: String) -> Result<User, AppError> {
        let created_at = now();
        let probe_email = email.clone();
        let probe_username = username.clone();
        self.table
            .insert_unless(
                move |u| u.email.eq_ignore_ascii_case(&probe_email) || u.username == probe_username,
                move |id| User { id, username, email, password_hash, created_at, updated_at: created_at },
            )
            .await
            .ok_or_else(|| AppError::Conflict("User already exists".into()))
    }

    async fn find_by_id(&self, id: Id) -> Result<User, AppError> {
        self.table.get(id).await.ok_or_else(|| AppError::NotFound("User not found".into()))
    }

    async fn find_by_email(&self, email: &str) -> Result<User, AppError> {
        self.table
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .await
            .ok_or_else(|| AppError::NotFound("User not found".into()))
    }

    async fn update_password(&self, id: Id, password_hash: String) -> Result<User, AppError> {
        self.table
            .update_with(id, |u| {
                u.password_hash = password_hash;
                u.updated_at = now();
            })
            .await
            .ok_or_else(|| AppError::NotFound("User not found".into()))
    }
}

/// One handle per resource, shared by every handler through `AppState`.
#[derive(Clone)]
pub struct Repositories {
    pub todos: Arc<dyn TodoRepository>,
    pub comments: Arc<dyn CommentRepository>,
    pub articles: Arc<dyn ArticleRepository>,
    pub posts: Arc<dyn PostRepository>,
    pub users: Arc<dyn UserRepository>,
}

impl Repositories {
    /// Inserts the demo articles the frontend expects on a fresh start.
    pub async fn seed_demo_data(&self) -> Result<(), AppError> {
        let samples = [
            (1, "Welcome to the demo", "This article is seeded on startup.", true),
            (2, "Draft from another author", "Unpublished demo content.", false),
        ];
        for (user_id, title, content, published) in samples {
            self.articles
                .create(NewArticle { user_id, title: title.into(), content: content.into(), published })
                .await?;
        }
        tracing::debug!(articles = samples.len(), "seeded demo data");
        Ok(())
    }
}

/// Factory for repositories; every store currently lives in process memory.
#[derive(Debug, Clone)]
pub struct RepositoryFactory;

impl RepositoryFactory {
    pub fn in_memory() -> Repositories {
        Repositories {
            todos: Arc::new(InMemoryTodoRepository::default()),
            comments: Arc::new(InMemoryCommentRepository::default()),
            articles: Arc::new(InMemoryArticleRepository::default()),
            posts: Arc::new(InMemoryPostRepository::default()),
            users: Arc::new(InMemoryUserRepository::default()),
        }
    }
}
