use actix_cors::Cors;
use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer, ResponseError, Result as ActixResult};
use semrel_core::{CandidateFilter, ConceptId, Error, FilterCondition, PhraseResolver, QueryEngine, SimilarityResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_K: usize = 10;

/// Errors returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("query worker failed: {0}")]
    Blocking(#[from] actix_web::error::BlockingError),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Blocking(_) => "internal",
            ApiError::Engine(e) => match e {
                Error::NotFound(_) => "not_found",
                Error::NotBuilt { .. } => "not_built",
                Error::NotFitted(_) => "not_fitted",
                Error::Configuration(_) => "configuration",
                Error::CapacityExceeded { .. } => "capacity_exceeded",
                Error::Normalization(_) => "normalization",
                Error::Cancelled(_) => "cancelled",
                Error::Corrupt(_) => "corrupt",
                Error::Io(_) | Error::Serialization(_) => "internal",
            },
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Blocking(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(e) => match e {
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::NotBuilt { .. } | Error::NotFitted(_) => StatusCode::SERVICE_UNAVAILABLE,
                Error::CapacityExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                Error::Configuration(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }))
    }
}

/// Shared handler state
pub struct ApiState {
    engine: Arc<QueryEngine>,
    resolver: Option<Arc<PhraseResolver>>,
    language: String,
    metric: String,
}

impl ApiState {
    /// `language` and `metric` answer requests that name neither
    pub fn new(engine: Arc<QueryEngine>, language: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            engine,
            resolver: None,
            language: language.into(),
            metric: metric.into(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<PhraseResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn target<'a>(&'a self, target: &'a Target) -> (&'a str, &'a str) {
        (
            target.language.as_deref().unwrap_or(&self.language),
            target.metric.as_deref().unwrap_or(&self.metric),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct Target {
    language: Option<String>,
    metric: Option<String>,
}

#[derive(Deserialize)]
struct SimilarityRequest {
    #[serde(flatten)]
    target: Target,
    a: u32,
    b: u32,
}

#[derive(Deserialize)]
struct MostSimilarRequest {
    #[serde(flatten)]
    target: Target,
    id: u32,
    k: Option<usize>,
    /// Restrict results to these concepts
    only: Option<Vec<u32>>,
    exclude: Option<Vec<u32>>,
}

#[derive(Deserialize)]
struct CosimilarityRequest {
    #[serde(flatten)]
    target: Target,
    rows: Vec<u32>,
    cols: Vec<u32>,
}

#[derive(Deserialize)]
struct PhraseRequest {
    phrase: String,
    k: Option<usize>,
}

#[derive(Serialize)]
struct ResultsResponse {
    result: Vec<SimilarityResult>,
}

fn ids(raw: &[u32]) -> Vec<ConceptId> {
    raw.iter().copied().map(ConceptId).collect()
}

fn candidate_filter(req: &MostSimilarRequest) -> Option<CandidateFilter> {
    let mut conditions = Vec::new();
    if let Some(only) = &req.only {
        conditions.push(FilterCondition::Only(ids(only).into_iter().collect()));
    }
    if let Some(exclude) = &req.exclude {
        conditions.push(FilterCondition::Exclude(ids(exclude).into_iter().collect()));
    }
    match conditions.len() {
        0 => None,
        1 => conditions.pop().map(CandidateFilter::new),
        _ => Some(CandidateFilter::new(FilterCondition::And(conditions))),
    }
}

pub struct RestApi;

impl RestApi {
    pub async fn start(state: Arc<ApiState>, port: u16) -> std::io::Result<()> {
        info!("HTTP API listening on 0.0.0.0:{}", port);
        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .wrap(cors)
                .app_data(web::Data::from(state.clone()))
                .configure(Self::configure)
        })
        .bind(("0.0.0.0", port))?
        .run()
        .await
    }

    /// Register every route; also used to mount the API in tests
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::JsonConfig::default().error_handler(|err, _| {
            ApiError::BadRequest(err.to_string()).into()
        }))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics))
        .route("/similarity", web::post().to(similarity))
        .route("/most_similar", web::post().to(most_similar))
        .route("/cosimilarity", web::post().to(cosimilarity))
        .route("/explain", web::post().to(explain))
        .route("/phrases/most_similar", web::post().to(phrase_most_similar));
    }
}

async fn health() -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

async fn metrics(state: web::Data<ApiState>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "queries": state.engine.stats(),
        "limits": state.engine.limits(),
        "metrics": state.engine.status(),
    })))
}

/// Run engine work on the blocking thread pool, off the actix worker
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> semrel_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(web::block(work).await??)
}

async fn similarity(
    state: web::Data<ApiState>,
    req: web::Json<SimilarityRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let result = blocking(move || {
        let (language, metric) = state.target(&req.target);
        state
            .engine
            .similarity(language, metric, ConceptId(req.a), ConceptId(req.b))
    })
    .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "result": result })))
}

async fn most_similar(
    state: web::Data<ApiState>,
    req: web::Json<MostSimilarRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let results = blocking(move || {
        let (language, metric) = state.target(&req.target);
        let filter = candidate_filter(&req);
        let results = state.engine.most_similar(
            language,
            metric,
            ConceptId(req.id),
            req.k.unwrap_or(DEFAULT_K),
            filter.as_ref().map(|f| f as &dyn semrel_core::Filter),
        )?;
        debug!("most_similar {} on {}@{}: {} results", req.id, metric, language, results.len());
        Ok(results)
    })
    .await?;
    Ok(HttpResponse::Ok().json(ResultsResponse {
        result: results.into_vec(),
    }))
}

async fn cosimilarity(
    state: web::Data<ApiState>,
    req: web::Json<CosimilarityRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let matrix = blocking(move || {
        let (language, metric) = state.target(&req.target);
        state
            .engine
            .cosimilarity(language, metric, &ids(&req.rows), &ids(&req.cols))
    })
    .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "result": matrix })))
}

async fn explain(
    state: web::Data<ApiState>,
    req: web::Json<SimilarityRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let explained = blocking(move || {
        let (language, metric) = state.target(&req.target);
        state
            .engine
            .explain(language, metric, ConceptId(req.a), ConceptId(req.b))
    })
    .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "result": explained })))
}

async fn phrase_most_similar(
    state: web::Data<ApiState>,
    req: web::Json<PhraseRequest>,
) -> Result<HttpResponse, ApiError> {
    let resolver = state
        .resolver
        .clone()
        .ok_or_else(|| ApiError::BadRequest("no phrase dictionary is loaded".to_string()))?;
    let req = req.into_inner();
    let results = blocking(move || resolver.most_similar(&req.phrase, req.k.unwrap_or(DEFAULT_K))).await?;
    Ok(HttpResponse::Ok().json(ResultsResponse {
        result: results.into_vec(),
    }))
}
