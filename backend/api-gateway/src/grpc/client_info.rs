use tonic::{Request, Response, Status};

use crate::proto::video::client_info_service_server::ClientInfoService as ClientInfoRpc;
use crate::proto::video::{
    ApiResponse, ClientInfo, ConnectionEvent, GetClientInfoRequest, ListClientsRequest,
    ListClientsResponse, UpdateClientRequest,
};
use crate::services::ClientInfoService;

pub struct ClientInfoGrpc {
    clients: ClientInfoService,
}

impl ClientInfoGrpc {
    pub fn new(clients: ClientInfoService) -> Self {
        Self { clients }
    }
}

#[tonic::async_trait]
impl ClientInfoRpc for ClientInfoGrpc {
    async fn client_connected(
        &self,
        request: Request<ConnectionEvent>,
    ) -> Result<Response<ApiResponse>, Status> {
        let resp = self.clients.client_connected(request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    async fn client_disconnected(
        &self,
        request: Request<ConnectionEvent>,
    ) -> Result<Response<ApiResponse>, Status> {
        let resp = self.clients.client_disconnected(request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    async fn update_client_info(
        &self,
        request: Request<UpdateClientRequest>,
    ) -> Result<Response<ApiResponse>, Status> {
        let req = request.into_inner();
        let resp = self
            .clients
            .update_client_info(&req.client_id, req.client_info)
            .await?;
        Ok(Response::new(resp))
    }

    async fn get_client_info(
        &self,
        request: Request<GetClientInfoRequest>,
    ) -> Result<Response<ClientInfo>, Status> {
        let client_id = request.into_inner().client_id;
        let client = self.clients.get_client_info(&client_id).await?;
        Ok(Response::new(client))
    }

    async fn list_active_clients(
        &self,
        request: Request<ListClientsRequest>,
    ) -> Result<Response<ListClientsResponse>, Status> {
        let req = request.into_inner();
        let resp = self.clients.list_active_clients(req.page, req.limit).await;
        Ok(Response::new(resp))
    }
}
