//! API design rules, evaluated in a fixed window around each route
//! declaration (decorator, router call or verb-prefixed handler).

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::rules::{LineContext, LineRule, RuleSet};
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

/// Lines scanned on each side of a route declaration.
const ROUTE_WINDOW: usize = 10;

static ROUTE_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^@?(?:app|router|api|bp|blueprint|\w+_router)\.(?:route|get|post|put|patch|delete|api_route)\(|^@api_view",
    )
    .unwrap()
});

static VERB_HANDLER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:async\s+)?def\s+(?:get|post|put|delete)_(\w+)").unwrap());

static PATH_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["'](/[^"']*)["']"#).unwrap());

static VERB_IN_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:get|post|put|delete|fetch|create|update|remove)(?:[_-]|[A-Z])").unwrap()
});

static VERSIONED_PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/v\d+\b").unwrap());

const MUTATING_CALLS: &[&str] = &[
    ".save(",
    ".delete(",
    ".commit(",
    ".insert(",
    ".update(",
    "insert into",
    "delete from",
];

/// Decorator or router call, or an undecorated verb-prefixed handler.
fn is_route(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    if ROUTE_DECL_RE.is_match(lower) {
        return true;
    }
    VERB_HANDLER_RE.is_match(lower) && !ctx.prev_has(1, &["@"])
}

fn route_window_lacks(ctx: &Ctx<'_, '_>, needles: &[&str]) -> bool {
    is_route(ctx) && !ctx.around_has(ROUTE_WINDOW, ROUTE_WINDOW, needles)
}

fn route_path(ctx: &Ctx<'_, '_>) -> Option<String> {
    if !is_route(ctx) && !ctx.has(&["path=", "url="]) {
        return None;
    }
    PATH_LITERAL_RE
        .captures(ctx.raw())
        .map(|c| c[1].to_string())
}

fn get_mutation(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    if let Some(caps) = VERB_HANDLER_RE.captures(lower) {
        if lower.contains("def get_")
            && ["post", "put", "delete", "patch", "update", "create"]
                .iter()
                .any(|v| caps[1].contains(v))
        {
            return true;
        }
    }
    let get_route = ROUTE_DECL_RE.is_match(lower)
        && (lower.contains(".get(") || lower.contains("methods=['get']") || lower.contains("methods=[\"get\"]"));
    get_route && ctx.next_has(ROUTE_WINDOW, MUTATING_CALLS)
}

fn missing_error_handling(ctx: &Ctx<'_, '_>) -> bool {
    is_route(ctx)
        && !ctx.next_has(
            ROUTE_WINDOW,
            &["try:", "except", "raise", "abort(", "httpexception", "catch", "try {"],
        )
}

fn verb_in_url(ctx: &Ctx<'_, '_>) -> bool {
    route_path(ctx).is_some_and(|p| VERB_IN_PATH_RE.is_match(&p))
}

/// A single path mixing snake_case, kebab-case and camelCase segments.
fn inconsistent_naming(ctx: &Ctx<'_, '_>) -> bool {
    let Some(path) = route_path(ctx) else {
        return false;
    };
    let mut snake = false;
    let mut kebab = false;
    let mut camel = false;
    for segment in path
        .split('/')
        .filter(|s| !s.is_empty() && !s.starts_with('<') && !s.starts_with('{') && !s.starts_with(':'))
    {
        snake |= segment.contains('_');
        kebab |= segment.contains('-');
        camel |= segment.chars().skip(1).any(|c| c.is_ascii_uppercase());
    }
    [snake, kebab, camel].iter().filter(|&&s| s).count() > 1
        || path.to_lowercase().contains("/user_profile")
}

fn missing_versioning(ctx: &Ctx<'_, '_>) -> bool {
    ROUTE_DECL_RE.is_match(ctx.lower())
        && route_path(ctx).is_some_and(|p| !VERSIONED_PATH_RE.is_match(&p))
        && !ctx.has(&["version"])
}

fn missing_validation(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[
        "request.json",
        "request.form",
        "request.args",
        "request.data",
        "request.get_json(",
        "req.body",
    ]) && !ctx.around_has(
        5,
        ROUTE_WINDOW,
        &["validate", "schema", "pydantic", "marshmallow", "validator", "basemodel"],
    )
}

fn missing_auth(ctx: &Ctx<'_, '_>) -> bool {
    route_window_lacks(
        ctx,
        &["auth", "login", "token", "jwt", "oauth", "permission", "role", "current_user", "depends("],
    )
}

fn missing_rate_limiting(ctx: &Ctx<'_, '_>) -> bool {
    route_window_lacks(ctx, &["rate_limit", "ratelimit", "throttle", "limiter", "quota"])
}

/// App-wide CORS setup anywhere in the file counts.
fn missing_cors(ctx: &Ctx<'_, '_>) -> bool {
    route_window_lacks(ctx, &["cors", "access-control", "cross-origin"])
        && !ctx.view.lower_text().contains("cors(")
        && !ctx.view.lower_text().contains("corsmiddleware")
}

fn missing_headers(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["return jsonify", "return json", "return response", "return data"])
        && !ctx.around_has(5, 5, &["content-type", "content_type", "headers", "mimetype"])
}

fn missing_pagination(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    let returns_collection = ["return users", "return items", "return data", "return list", "return results"]
        .iter()
        .any(|p| lower.starts_with(p))
        || (lower.starts_with("return") && lower.contains(".all()"));
    if !returns_collection {
        return false;
    }
    let follows_route = ctx
        .view
        .lowered_range(ctx.index.saturating_sub(ROUTE_WINDOW), ctx.index)
        .any(|l| ROUTE_DECL_RE.is_match(l) || l.starts_with("def get_") || l.starts_with("def post_"));
    follows_route
        && !ctx.around_has(
            ROUTE_WINDOW,
            ROUTE_WINDOW,
            &["page", "limit", "offset", "pagination", "cursor"],
        )
}

fn missing_documentation(ctx: &Ctx<'_, '_>) -> bool {
    route_window_lacks(
        ctx,
        &["\"\"\"", "'''", "docstring", "summary", "description", "tags", "responses", "/**"],
    )
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "API_GET_MUTATION",
        severity: Severity::High,
        message: "GET endpoint should not modify data - use POST/PUT/DELETE for mutations",
        applies: get_mutation,
    },
    LineRule {
        id: "API_MISSING_ERROR_HANDLING",
        severity: Severity::Medium,
        message: "API endpoint missing error handling - add try/except blocks",
        applies: missing_error_handling,
    },
    LineRule {
        id: "API_VERB_IN_URL",
        severity: Severity::Medium,
        message: "REST URLs should not include HTTP verbs - use resource-based naming",
        applies: verb_in_url,
    },
    LineRule {
        id: "API_INCONSISTENT_NAMING",
        severity: Severity::Low,
        message: "Inconsistent URL naming convention - use kebab-case or camelCase consistently",
        applies: inconsistent_naming,
    },
    LineRule {
        id: "API_MISSING_VERSIONING",
        severity: Severity::Low,
        message: "API endpoint missing versioning - consider adding /v1/ prefix",
        applies: missing_versioning,
    },
    LineRule {
        id: "API_MISSING_VALIDATION",
        severity: Severity::High,
        message: "API endpoint missing input validation - add schema validation",
        applies: missing_validation,
    },
    LineRule {
        id: "API_MISSING_AUTH",
        severity: Severity::High,
        message: "API endpoint missing authentication/authorization - add security checks",
        applies: missing_auth,
    },
    LineRule {
        id: "API_MISSING_RATE_LIMITING",
        severity: Severity::Medium,
        message: "API endpoint missing rate limiting - add throttling protection",
        applies: missing_rate_limiting,
    },
    LineRule {
        id: "API_MISSING_CORS",
        severity: Severity::Medium,
        message: "API endpoint missing CORS headers - add cross-origin support",
        applies: missing_cors,
    },
    LineRule {
        id: "API_MISSING_HEADERS",
        severity: Severity::Low,
        message: "API response missing proper headers - set Content-Type and other headers",
        applies: missing_headers,
    },
    LineRule {
        id: "API_MISSING_PAGINATION",
        severity: Severity::Medium,
        message: "List API endpoint missing pagination - add page/limit parameters",
        applies: missing_pagination,
    },
    LineRule {
        id: "API_MISSING_DOCUMENTATION",
        severity: Severity::Low,
        message: "API endpoint missing documentation - add docstrings or OpenAPI annotations",
        applies: missing_documentation,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("API_GET_MUTATION", "Use proper HTTP methods - GET for reading, POST/PUT/DELETE for mutations"),
    ("API_MISSING_ERROR_HANDLING", "Add comprehensive error handling with try/except blocks and proper HTTP status codes"),
    ("API_VERB_IN_URL", "Use resource-based URLs instead of HTTP verbs in endpoint paths"),
    ("API_INCONSISTENT_NAMING", "Use consistent URL naming conventions (kebab-case or camelCase)"),
    ("API_MISSING_VERSIONING", "Implement API versioning with /v1/, /v2/ prefixes for backward compatibility"),
    ("API_MISSING_VALIDATION", "Add input validation using Pydantic, Marshmallow, or similar schema validation"),
    ("API_MISSING_AUTH", "Implement authentication and authorization using JWT, OAuth, or similar mechanisms"),
    ("API_MISSING_RATE_LIMITING", "Add rate limiting to prevent API abuse and ensure fair usage"),
    ("API_MISSING_CORS", "Configure CORS headers for cross-origin requests"),
    ("API_MISSING_HEADERS", "Set proper response headers including Content-Type and custom headers"),
    ("API_MISSING_PAGINATION", "Implement pagination for list endpoints to handle large datasets efficiently"),
    ("API_MISSING_DOCUMENTATION", "Add comprehensive API documentation using OpenAPI/Swagger or docstrings"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::ApiDesign,
    rules: RULES,
    file_pass: None,
    suggestions: SUGGESTIONS,
};
