//! PocketBase REST client

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, multipart};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{FileUpload, Filter, ListOptions, ListPage, RecordStore, StoreError};

/// Record store backed by a PocketBase instance, authenticated as a superuser.
#[derive(Clone)]
pub struct PocketBaseStore {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    identity: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl PocketBaseStore {
    /// Authenticate against `_superusers` and return a ready client.
    pub async fn connect(base_url: &str, email: &str, password: &str) -> Result<Self, StoreError> {
        let client = Client::new();
        let base_url = base_url.trim_end_matches('/').to_string();

        let response = client
            .post(format!(
                "{}/api/collections/_superusers/auth-with-password",
                base_url
            ))
            .json(&AuthRequest {
                identity: email,
                password,
            })
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let auth: AuthResponse = check(response, "_superusers")
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        tracing::info!("Authenticated with record store at {}", base_url);

        Ok(Self {
            client,
            base_url,
            token: auth.token,
        })
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", &self.token)
    }

    async fn send_json(&self, builder: RequestBuilder, what: &str) -> Result<Value, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        check(response, what)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Map non-success statuses to `StoreError`.
async fn check(response: Response, what: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(what.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(StoreError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Render a JSON scalar as a multipart text field.
fn form_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RecordStore for PocketBaseStore {
    async fn create(&self, collection: &str, data: Value) -> Result<Value, StoreError> {
        let builder = self
            .request(Method::POST, self.records_url(collection))
            .json(&data);
        self.send_json(builder, collection).await
    }

    async fn create_with_file(
        &self,
        collection: &str,
        data: Value,
        file: FileUpload,
    ) -> Result<Value, StoreError> {
        let mut form = multipart::Form::new();
        if let Value::Object(fields) = &data {
            for (key, value) in fields {
                form = form.text(key.clone(), form_text(value));
            }
        }

        let part = multipart::Part::bytes(file.content)
            .file_name(file.file_name)
            .mime_str(&file.content_type)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        form = form.part(file.field, part);

        let builder = self
            .request(Method::POST, self.records_url(collection))
            .multipart(form);
        self.send_json(builder, collection).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        let builder = self
            .request(
                Method::PATCH,
                format!("{}/{}", self.records_url(collection), id),
            )
            .json(&patch);
        self.send_json(builder, &format!("{}/{}", collection, id))
            .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let response = self
            .request(
                Method::DELETE,
                format!("{}/{}", self.records_url(collection), id),
            )
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        check(response, &format!("{}/{}", collection, id)).await?;
        Ok(())
    }

    async fn get_one(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        let builder = self.request(
            Method::GET,
            format!("{}/{}", self.records_url(collection), id),
        );
        self.send_json(builder, &format!("{}/{}", collection, id))
            .await
    }

    async fn get_list(
        &self,
        collection: &str,
        page: usize,
        per_page: usize,
        options: &ListOptions,
    ) -> Result<ListPage<Value>, StoreError> {
        let mut query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("perPage", per_page.to_string()),
        ];
        if let Some(filter) = &options.filter {
            query.push(("filter", filter.to_string()));
        }
        if let Some(sort) = &options.sort {
            query.push(("sort", sort.clone()));
        }
        if options.skip_total {
            query.push(("skipTotal", "1".to_string()));
        }

        let builder = self
            .request(Method::GET, self.records_url(collection))
            .query(&query);
        let value = self.send_json(builder, collection).await?;
        serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn get_first_list_item(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Value>, StoreError> {
        let options = ListOptions {
            filter: Some(filter.clone()),
            sort: None,
            skip_total: true,
        };
        match self.get_list(collection, 1, 1, &options).await {
            Ok(page) => Ok(page.items.into_iter().next()),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
