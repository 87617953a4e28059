use std::time::Duration;

use reqwest::header::{self, HeaderMap};

use crate::{api::Problem, trans::Response, Error, Result};

pub(crate) fn http_client(user_agent: &str) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(30))
        .build()?)
}

pub(crate) async fn req_get(http: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("GET {url}");
    Ok(http.get(url).send().await?)
}

pub(crate) async fn req_head(http: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("HEAD {url}");
    Ok(http.head(url).send().await?)
}

pub(crate) async fn req_post(
    http: &reqwest::Client,
    url: &str,
    body: String,
) -> Result<reqwest::Response> {
    log::trace!("POST {url} {body}");
    Ok(http
        .post(url)
        .header(header::CONTENT_TYPE, "application/jose+json")
        .body(body)
        .send()
        .await?)
}

/// Reads the full response, turning non-2xx statuses into [`Error::Remote`].
pub(crate) async fn req_handle_error(res: reqwest::Response, max_body_size: usize) -> Result<Response> {
    let status = res.status();
    let headers = res.headers().clone();

    if res
        .content_length()
        .is_some_and(|len| len > max_body_size as u64)
    {
        return Err(Error::protocol(format!(
            "response body larger than {max_body_size} bytes"
        )));
    }

    let body = res.bytes().await?;
    if body.len() > max_body_size {
        return Err(Error::protocol(format!(
            "response body larger than {max_body_size} bytes"
        )));
    }

    // ok responses pass through
    if status.is_success() {
        return Ok(Response::new(status.as_u16(), headers, body.to_vec()));
    }

    let is_problem = headers
        .get(header::CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    let problem = if is_problem {
        serde_json::from_slice(&body).unwrap_or_else(|err| Problem {
            _type: "problemJsonFail".to_owned(),
            detail: Some(format!(
                "Failed to deserialize application/problem+json ({err}) body: {}",
                String::from_utf8_lossy(&body)
            )),
            status: Some(status.as_u16()),
            subproblems: None,
        })
    } else {
        Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {}", String::from_utf8_lossy(&body))),
            status: Some(status.as_u16()),
            subproblems: None,
        }
    };

    Err(Error::Remote {
        status: status.as_u16(),
        problem,
        location: header_str(&headers, header::LOCATION.as_str()).map(ToOwned::to_owned),
    })
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn req_expect_header(headers: &HeaderMap, name: &str) -> Result<String> {
    header_str(headers, name)
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::protocol(format!("missing header: {name}")))
}
