//! Public route resolution.
//!
//! One `matchit` router per HTTP method maps a public path to the module that owns it
//! and to the backend path the request should be forwarded to.
use std::collections::HashMap;

use http::Method;

use crate::{config::models::Route, core::module::ModuleRecord};

const RESOURCE_SUFFIX: &str = "/resources/{*filepath}";

#[derive(Debug, Clone)]
struct RouteTarget {
    module: String,
    to: String,
}

/// A resolved public request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub module: String,
    /// Backend path with captured parameters substituted; may carry a query
    pub backend_path: String,
}

/// The routes a module is reachable on, in declaration order. Web modules get a
/// resource passthrough appended last, prefixed by their first route when that route
/// is more than `/`.
pub fn effective_routes(record: &ModuleRecord) -> Vec<Route> {
    let mut routes = record.binding.routes.clone();
    if record.types.web {
        let prefix = routes
            .first()
            .map(|r| r.from.as_str())
            .filter(|from| from.len() > 1)
            .map(|from| from.trim_end_matches('/'))
            .unwrap_or("");
        routes.push(Route::new(format!("{prefix}{RESOURCE_SUFFIX}"), RESOURCE_SUFFIX));
    }
    routes
}

#[derive(Default)]
pub struct RouteTable {
    routers: HashMap<Method, matchit::Router<RouteTarget>>,
    len: usize,
}

impl RouteTable {
    /// Build the table from records. Records are visited by name so that conflicts
    /// resolve the same way on every start; a conflicting route is logged and skipped.
    pub fn build<'a>(records: impl IntoIterator<Item = &'a ModuleRecord>) -> Self {
        let mut records: Vec<&ModuleRecord> = records.into_iter().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));

        let mut table = Self::default();
        for record in records {
            for route in effective_routes(record) {
                table.insert(&record.name, &route);
            }
        }
        table
    }

    fn insert(&mut self, module: &str, route: &Route) {
        for method in &route.methods {
            let Ok(method) = method.to_uppercase().parse::<Method>() else {
                tracing::warn!(
                    "Skipping route {} of module '{}': invalid method '{}'",
                    route.from,
                    module,
                    method
                );
                continue;
            };
            let target = RouteTarget {
                module: module.to_string(),
                to: route.to.clone(),
            };
            match self
                .routers
                .entry(method.clone())
                .or_default()
                .insert(route.from.clone(), target)
            {
                Ok(()) => {
                    self.len += 1;
                    tracing::debug!("Route {} {} -> module '{}'", method, route.from, module);
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping route {} {} of module '{}': {}",
                        method,
                        route.from,
                        module,
                        e
                    );
                }
            }
        }
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let lookup = |method: &Method| self.routers.get(method)?.at(path).ok();
        let matched = match lookup(method) {
            Some(matched) => matched,
            // HEAD is served by GET routes unless a HEAD route matches
            None if method == Method::HEAD => lookup(&Method::GET)?,
            None => return None,
        };

        let mut backend_path = matched.value.to.clone();
        for (key, value) in matched.params.iter() {
            backend_path = backend_path
                .replace(&format!("{{*{key}}}"), value)
                .replace(&format!("{{{key}}}"), value);
        }

        Some(RouteMatch {
            module: matched.value.module.clone(),
            backend_path,
        })
    }

    /// Number of (method, pattern) pairs installed
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{BindingConfig, ModuleConfig};

    fn module(name: &str, types: &str, routes: Vec<Route>) -> ModuleRecord {
        ModuleRecord::from_config(
            name,
            &ModuleConfig {
                types: types.to_string(),
                binding: BindingConfig {
                    port: 4001,
                    routes,
                    ..BindingConfig::default()
                },
                ..ModuleConfig::default()
            },
        )
    }

    #[test]
    fn test_resource_route_appended_last() {
        let record = module("alpha", "web", vec![Route::new("/alpha", "/")]);
        let routes = effective_routes(&record);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1].from, "/alpha/resources/{*filepath}");
        assert_eq!(routes[1].to, "/resources/{*filepath}");

        let root = module("root", "web", vec![Route::new("/", "/")]);
        assert_eq!(effective_routes(&root)[1].from, "/resources/{*filepath}");

        let plain = module("plain", "", vec![Route::new("/plain", "/")]);
        assert_eq!(effective_routes(&plain).len(), 1);
    }

    #[test]
    fn test_resolve_substitutes_params() {
        let record = module(
            "alpha",
            "web",
            vec![
                Route::new("/alpha", "/?view=main"),
                Route::new("/alpha/items/{id}", "/api/items/{id}"),
            ],
        );
        let table = RouteTable::build([&record]);

        let m = table.resolve(&Method::GET, "/alpha/items/42").unwrap();
        assert_eq!(m.module, "alpha");
        assert_eq!(m.backend_path, "/api/items/42");

        let m = table
            .resolve(&Method::GET, "/alpha/resources/css/site.css")
            .unwrap();
        assert_eq!(m.backend_path, "/resources/css/site.css");

        let m = table.resolve(&Method::HEAD, "/alpha").unwrap();
        assert_eq!(m.backend_path, "/?view=main");
    }

    #[test]
    fn test_method_filtering() {
        let mut route = Route::new("/alpha/submit", "/submit");
        route.methods = vec!["POST".to_string()];
        let record = module("alpha", "", vec![route]);
        let table = RouteTable::build([&record]);

        assert!(table.resolve(&Method::POST, "/alpha/submit").is_some());
        assert!(table.resolve(&Method::GET, "/alpha/submit").is_none());
        assert!(table.resolve(&Method::GET, "/missing").is_none());
    }

    #[test]
    fn test_head_falls_back_to_get_per_path() {
        let mut head_only = Route::new("/alpha/ping", "/ping");
        head_only.methods = vec!["HEAD".to_string()];
        let record = module(
            "alpha",
            "",
            vec![Route::new("/alpha/page", "/page"), head_only],
        );
        let table = RouteTable::build([&record]);

        assert_eq!(
            table.resolve(&Method::HEAD, "/alpha/ping").unwrap().backend_path,
            "/ping"
        );
        assert_eq!(
            table.resolve(&Method::HEAD, "/alpha/page").unwrap().backend_path,
            "/page"
        );
        assert!(table.resolve(&Method::GET, "/alpha/ping").is_none());
    }

    #[test]
    fn test_conflicting_route_is_skipped() {
        let a = module("alpha", "", vec![Route::new("/shared", "/a")]);
        let b = module("beta", "", vec![Route::new("/shared", "/b")]);
        let table = RouteTable::build([&b, &a]);

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.resolve(&Method::GET, "/shared").unwrap().module,
            "alpha"
        );
    }
}
