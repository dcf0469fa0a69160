//! Python extension module `_vigil_core`.
//!
//! Results cross the boundary as plain dicts built from each type's serde
//! representation.

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyString};
use pyo3::wrap_pyfunction;
use serde::Serialize;
use serde_json::Value;

use crate::analysis::orchestrator::Orchestrator;
use crate::config::{self, VigilConfig};
use crate::errors::VigilError;
use crate::models::{AnalysisResponse, Plan};
use crate::service::{AnalysisRequest, AnalysisService};

fn json_to_py<'py>(py: Python<'py>, value: &Value) -> PyResult<Bound<'py, PyAny>> {
    Ok(match value {
        Value::Null => py.None().into_bound(py),
        Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_pyobject(py)?.into_any()
            } else if let Some(u) = n.as_u64() {
                u.into_pyobject(py)?.into_any()
            } else {
                PyFloat::new(py, n.as_f64().unwrap_or(f64::NAN)).into_any()
            }
        }
        Value::String(s) => PyString::new(py, s).into_any(),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            list.into_any()
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            dict.into_any()
        }
    })
}

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let json = serde_json::to_value(value).map_err(VigilError::from)?;
    Ok(json_to_py(py, &json)?.unbind())
}

#[pyclass(name = "AnalysisService")]
pub struct PyAnalysisService {
    inner: AnalysisService,
}

#[pymethods]
impl PyAnalysisService {
    /// `config_json` is a `VigilConfig` document; `secret` overrides its
    /// token secret.
    #[new]
    #[pyo3(signature = (config_json=None, secret=None))]
    fn new(config_json: Option<&str>, secret: Option<&str>) -> PyResult<Self> {
        let mut config = match config_json {
            Some(raw) => serde_json::from_str::<VigilConfig>(raw).map_err(VigilError::from)?,
            None => VigilConfig::default(),
        };
        if let Some(secret) = secret {
            config = config.with_secret(secret);
        }
        Ok(Self {
            inner: AnalysisService::new(config)?,
        })
    }

    #[pyo3(signature = (code, language, client_ip, token=None))]
    fn analyze(
        &self,
        py: Python<'_>,
        code: String,
        language: String,
        client_ip: String,
        token: Option<String>,
    ) -> PyResult<PyObject> {
        let request = AnalysisRequest {
            code,
            language,
            token,
            client_ip,
        };
        let response = py.allow_threads(|| self.inner.analyze(&request))?;
        to_py(py, &response)
    }

    #[pyo3(signature = (user_id, plan="free", client_ip=""))]
    fn issue_token(&self, user_id: &str, plan: &str, client_ip: &str) -> PyResult<String> {
        let plan: Plan = plan.parse()?;
        Ok(self.inner.issue_token(user_id, plan, client_ip)?)
    }

    fn suspicion(&self, py: Python<'_>, user_id: &str) -> PyResult<PyObject> {
        let report = self.inner.suspicion(user_id)?;
        to_py(py, &report)
    }

    #[pyo3(signature = (client_ip, token=None))]
    fn rate_limit_status(
        &self,
        py: Python<'_>,
        client_ip: &str,
        token: Option<&str>,
    ) -> PyResult<PyObject> {
        let status = self.inner.rate_limit_status(token, client_ip)?;
        to_py(py, &status)
    }
}

/// Stateless analysis with default limits and no admission control.
#[pyfunction]
fn analyze_code(py: Python<'_>, code: String, language: String) -> PyResult<PyObject> {
    let orchestrator = Orchestrator::new(&VigilConfig::default())?;
    let result = py.allow_threads(|| orchestrator.run(&code, &language))?;
    to_py(py, &AnalysisResponse::from_result(result, None))
}

#[pymodule]
fn _vigil_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAnalysisService>()?;
    m.add_function(wrap_pyfunction!(analyze_code, m)?)?;
    m.add("DEFAULT_MAX_CODE_CHARS", config::DEFAULT_MAX_CODE_CHARS)?;
    m.add("DEFAULT_ANALYSIS_BUDGET_MS", config::DEFAULT_ANALYSIS_BUDGET_MS)?;
    Ok(())
}
