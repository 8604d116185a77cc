// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The gRPC surface: a plain struct holding the orchestrator, composed with
//! the generated service skeleton.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};

use crate::clone::{CloneError, CloneRequest, Cloner, Recipient};

pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("ferrite.agent.v1");
}

pub use proto::agent_server::AgentServer;

pub struct AgentService<R> {
    cloner: Arc<Cloner<R>>,
}

impl<R> AgentService<R> {
    pub fn new(cloner: Arc<Cloner<R>>) -> Self {
        AgentService { cloner }
    }
}

impl TryFrom<proto::CloneRequest> for CloneRequest {
    type Error = Status;

    fn try_from(req: proto::CloneRequest) -> Result<Self, Status> {
        let port = u16::try_from(req.port)
            .map_err(|_| Status::invalid_argument("port is out of range"))?;
        let boot_timeout = match req.boot_timeout {
            Some(d) => Duration::try_from(d)
                .map_err(|_| Status::invalid_argument("boot_timeout must be positive"))?,
            None => return Err(Status::invalid_argument("boot_timeout is required")),
        };
        Ok(CloneRequest {
            donor_host: req.host,
            donor_port: port,
            donor_user: req.user,
            donor_password: req.password,
            init_user: req.init_user,
            init_password: req.init_password,
            boot_timeout,
        })
    }
}

impl From<CloneError> for Status {
    fn from(err: CloneError) -> Status {
        match err {
            CloneError::InvalidArgument(msg) => Status::invalid_argument(msg),
            CloneError::TooManyRequests => {
                Status::resource_exhausted("another request is under processing")
            }
            CloneError::NotEmpty => Status::failed_precondition("recipient is not empty"),
            // MySQL and boot errors are surfaced verbatim; the operator
            // retries the whole RPC.
            other => Status::internal(other.to_string()),
        }
    }
}

#[tonic::async_trait]
impl<R: Recipient + 'static> proto::agent_server::Agent for AgentService<R> {
    async fn clone(
        &self,
        request: Request<proto::CloneRequest>,
    ) -> Result<Response<proto::CloneResponse>, Status> {
        let request = CloneRequest::try_from(request.into_inner())?;
        self.cloner.execute(request).await?;
        Ok(Response::new(proto::CloneResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::SqlError;

    fn proto_request() -> proto::CloneRequest {
        proto::CloneRequest {
            host: "donor".into(),
            port: 3306,
            user: "clone-donor".into(),
            password: "pw".into(),
            init_user: String::new(),
            init_password: String::new(),
            boot_timeout: Some(prost_types::Duration {
                seconds: 300,
                nanos: 0,
            }),
        }
    }

    #[test]
    fn request_conversion() {
        let req = CloneRequest::try_from(proto_request()).unwrap();
        assert_eq!(req.donor_host, "donor");
        assert_eq!(req.donor_port, 3306);
        assert_eq!(req.boot_timeout, Duration::from_secs(300));
        assert!(!req.is_external());
    }

    #[test]
    fn request_conversion_rejects_bad_fields() {
        let mut no_timeout = proto_request();
        no_timeout.boot_timeout = None;
        assert!(CloneRequest::try_from(no_timeout).is_err());

        let mut negative = proto_request();
        negative.boot_timeout = Some(prost_types::Duration {
            seconds: -1,
            nanos: 0,
        });
        assert!(CloneRequest::try_from(negative).is_err());

        let mut big_port = proto_request();
        big_port.port = 70_000;
        assert!(CloneRequest::try_from(big_port).is_err());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            Status::from(CloneError::TooManyRequests).code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            Status::from(CloneError::NotEmpty).code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            Status::from(CloneError::InvalidArgument("host".into())).code(),
            tonic::Code::InvalidArgument
        );
        let sql = CloneError::Sql(SqlError::EmptyResult {
            sql: "SHOW MASTER STATUS".into(),
        });
        let status = Status::from(sql);
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("SHOW MASTER STATUS"));
        assert_eq!(
            Status::from(CloneError::NotEmpty).message(),
            "recipient is not empty"
        );
    }
}
